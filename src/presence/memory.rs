use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{PresenceStore, StoreError};
use crate::models::{now_ms, AccountType, OnlineUser, PresenceRecord, Role, DEFAULT_ROLE};

/// In-memory presence store for the test suite and for running the gateway
/// locally without Postgres. Implements the same partial-failure surface:
/// flipping [`MemoryPresenceStore::set_failing`] makes every operation
/// return an error, which is how the tests exercise the degraded paths.
#[derive(Default)]
pub struct MemoryPresenceStore {
    users: RwLock<HashMap<String, PresenceRecord>>,
    warp: RwLock<HashMap<String, Value>>,
    health: RwLock<HashMap<String, (i64, String)>>,
    failing: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn gate(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_owned()));
        }
        Ok(())
    }

    /// Seed a record directly, bypassing the contract semantics. Test setup
    /// only.
    pub async fn seed(&self, record: PresenceRecord) {
        self.users.write().await.insert(record.uuid.clone(), record);
    }

    pub async fn get(&self, uuid: &str) -> Option<PresenceRecord> {
        self.users.read().await.get(uuid).cloned()
    }

    pub async fn warp_payload(&self, key: &str) -> Option<Value> {
        self.warp.read().await.get(key).cloned()
    }
}

fn stub(uuid: &str) -> PresenceRecord {
    PresenceRecord {
        uuid: uuid.to_owned(),
        name: "Unknown".to_owned(),
        account_type: AccountType::Local,
        roles: vec![DEFAULT_ROLE],
        online: false,
        last_join: None,
        last_seen: None,
        last_leave: None,
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn mark_online(
        &self,
        user: &OnlineUser,
        roles_to_persist: Option<&[Role]>,
    ) -> Result<(), StoreError> {
        self.gate()?;
        let now = now_ms();
        let mut users = self.users.write().await;

        let entry = users.entry(user.uuid.clone()).or_insert_with(|| {
            let mut record = stub(&user.uuid);
            record.roles = user.roles.clone();
            record.last_join = Some(now);
            record
        });
        entry.name = user.name.clone();
        entry.account_type = user.account_type;
        entry.online = true;
        entry.last_seen = Some(now);
        if let Some(roles) = roles_to_persist {
            entry.roles = roles.to_vec();
        }
        Ok(())
    }

    async fn mark_offline(&self, uuid: &str) -> Result<(), StoreError> {
        self.gate()?;
        let mut users = self.users.write().await;
        let entry = users.entry(uuid.to_owned()).or_insert_with(|| stub(uuid));
        entry.online = false;
        entry.last_leave = Some(now_ms());
        Ok(())
    }

    async fn update_last_seen(&self, uuid: &str) -> Result<(), StoreError> {
        self.gate()?;
        if let Some(entry) = self.users.write().await.get_mut(uuid) {
            entry.last_seen = Some(now_ms());
            entry.online = true;
        }
        Ok(())
    }

    async fn update_roles(&self, uuid: &str, roles: &[Role]) -> Result<(), StoreError> {
        self.gate()?;
        if let Some(entry) = self.users.write().await.get_mut(uuid) {
            entry.roles = roles.to_vec();
        }
        Ok(())
    }

    async fn fetch_roles(&self, uuid: &str) -> Result<Option<Vec<Role>>, StoreError> {
        self.gate()?;
        Ok(self
            .users
            .read()
            .await
            .get(uuid)
            .map(|r| r.roles.clone())
            .filter(|r| !r.is_empty()))
    }

    async fn fetch_online_users(&self, limit: usize) -> Result<Vec<PresenceRecord>, StoreError> {
        self.gate()?;
        let users = self.users.read().await;
        let mut online: Vec<PresenceRecord> =
            users.values().filter(|r| r.online).cloned().collect();
        online.sort_by_key(|r| std::cmp::Reverse(r.last_seen.unwrap_or(0)));
        online.truncate(limit);
        Ok(online)
    }

    async fn count_online_users(&self) -> Result<u64, StoreError> {
        self.gate()?;
        Ok(self.users.read().await.values().filter(|r| r.online).count() as u64)
    }

    async fn load_started_at(
        &self,
        env: &str,
        commit_hash: &str,
        now_ms: i64,
    ) -> Result<i64, StoreError> {
        self.gate()?;
        let mut health = self.health.write().await;
        match health.get(env) {
            Some((started_at, hash)) if hash == commit_hash => Ok(*started_at),
            _ => {
                health.insert(env.to_owned(), (now_ms, commit_hash.to_owned()));
                Ok(now_ms)
            }
        }
    }

    async fn put_warp_status(&self, key: &str, payload: &Value) -> Result<(), StoreError> {
        self.gate()?;
        self.warp.write().await.insert(key.to_owned(), payload.clone());
        Ok(())
    }
}
