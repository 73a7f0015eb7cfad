pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{OnlineUser, PresenceRecord, Role};

pub use memory::MemoryPresenceStore;
pub use postgres::PostgresPresenceStore;

/// Transport or store-side failure. Callers log these with the uuid and
/// operation; they are never surfaced to a client socket.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Contract over the external presence store.
///
/// Every operation may suspend and may fail. The gateway proceeds with its
/// in-memory state on failure; the periodic heartbeat and verification
/// sweeps provide the natural retry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert the user record and flag it online. `last_join` is stamped on
    /// first insert, `last_seen` on every call. Roles are written only when
    /// `roles_to_persist` is given; otherwise the roles already in the store
    /// are preserved.
    async fn mark_online(
        &self,
        user: &OnlineUser,
        roles_to_persist: Option<&[Role]>,
    ) -> Result<(), StoreError>;

    /// Flag the user offline and stamp `last_leave`. Creates a stub record
    /// with default identity when none exists.
    async fn mark_offline(&self, uuid: &str) -> Result<(), StoreError>;

    /// Stamp `last_seen` and flag the user online.
    async fn update_last_seen(&self, uuid: &str) -> Result<(), StoreError>;

    /// Replace the stored role set.
    async fn update_roles(&self, uuid: &str, roles: &[Role]) -> Result<(), StoreError>;

    /// Canonical role set, or `None` when the record is absent or carries no
    /// roles.
    async fn fetch_roles(&self, uuid: &str) -> Result<Option<Vec<Role>>, StoreError>;

    /// Up to `limit` online records, most recently seen first.
    async fn fetch_online_users(&self, limit: usize) -> Result<Vec<PresenceRecord>, StoreError>;

    async fn count_online_users(&self) -> Result<u64, StoreError>;

    /// Read-or-init the single-row health record for `env`. The stored
    /// start time wins as long as the commit hash matches; a differing hash
    /// resets it to `now_ms`.
    async fn load_started_at(
        &self,
        env: &str,
        commit_hash: &str,
        now_ms: i64,
    ) -> Result<i64, StoreError>;

    /// Write one blob to the key/value side channel.
    async fn put_warp_status(&self, key: &str, payload: &Value) -> Result<(), StoreError>;
}
