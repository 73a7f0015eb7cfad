use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::{AccountType, Role};

/// Everything the gateway tracks for one authenticated socket. Only sockets
/// that have completed `auth` at least once get an entry; the same user
/// uuid may appear on several sockets (multi-device).
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    /// Never empty; resolution falls back to `[MEMBER]`.
    pub roles: Vec<Role>,
    pub connected_at: i64,
    pub last_seen: i64,
    pub last_keepalive_at: i64,
    pub is_alive: bool,
    pub ip: Option<String>,
    /// Outbound frame channel, drained by the socket's send task. Its
    /// closed flag doubles as the "socket still open" check.
    pub tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// In-process map from connection id to [`ConnectionState`]: the source of
/// truth for who is connected to *this* instance.
///
/// Cheaply cloneable; all clones share the same map via `Arc`. Sweeps and
/// broadcasts iterate a snapshot, so entries may be removed concurrently
/// without invalidating an iteration.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionState>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the state for a connection id.
    pub async fn insert(&self, conn_id: Uuid, state: ConnectionState) {
        self.connections.write().await.insert(conn_id, state);
    }

    /// Remove and return the state. Idempotent: a second remove is `None`,
    /// which is how close, heartbeat, and verification avoid double
    /// departure handling.
    pub async fn remove(&self, conn_id: Uuid) -> Option<ConnectionState> {
        self.connections.write().await.remove(&conn_id)
    }

    pub async fn get(&self, conn_id: Uuid) -> Option<ConnectionState> {
        self.connections.read().await.get(&conn_id).cloned()
    }

    /// Clone the current contents for lock-free iteration.
    pub async fn snapshot(&self) -> Vec<(Uuid, ConnectionState)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Stamp activity on a connection. Returns the entry's uuid, or `None`
    /// when the entry has vanished (e.g. a racing eviction), in which case
    /// the caller silently aborts.
    pub async fn touch(&self, conn_id: Uuid, now: i64) -> Option<String> {
        let mut connections = self.connections.write().await;
        let state = connections.get_mut(&conn_id)?;
        state.last_seen = state.last_seen.max(now);
        state.is_alive = true;
        Some(state.uuid.clone())
    }

    /// Replace the entry's role set. Returns the entry's uuid, or `None`
    /// when the entry has vanished.
    pub async fn set_roles(&self, conn_id: Uuid, roles: Vec<Role>) -> Option<String> {
        let mut connections = self.connections.write().await;
        let state = connections.get_mut(&conn_id)?;
        state.roles = roles;
        Some(state.uuid.clone())
    }

    pub async fn record_keepalive(&self, conn_id: Uuid, now: i64) {
        if let Some(state) = self.connections.write().await.get_mut(&conn_id) {
            state.last_keepalive_at = now;
        }
    }
}
