//! Fixtures shared by the in-crate unit tests: an [`AppState`] wired to the
//! in-memory store, channel-backed fake sockets, and frame drains.

use std::sync::Arc;

use axum::extract::ws::Message;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{Config, RunEnv};
use crate::models::{now_ms, AccountType, Role};
use crate::presence::MemoryPresenceStore;
use crate::state::AppState;
use crate::websocket::handler::SocketContext;
use crate::websocket::ConnectionState;

pub(crate) fn test_config() -> Config {
    Config {
        run_env: RunEnv::Test,
        host: "127.0.0.1".to_owned(),
        port: 0,
        database_url: "postgresql://unused".to_owned(),
        ws_path: "/websocket".to_owned(),
        admin_key: "test-admin-key-0123".to_owned(),
        heartbeat_interval_ms: 5_000,
        offline_after_ms: 10_000,
        rate_limit_window_ms: 15_000,
        rate_limit_max: 100,
        log_level: None,
        commit_hash: "test".to_owned(),
        verify_interval_ms: 60_000,
        warp_status_enabled: true,
    }
}

pub(crate) fn test_state() -> (AppState, Arc<MemoryPresenceStore>) {
    test_state_with(|_| {})
}

pub(crate) fn test_state_with(
    tweak: impl FnOnce(&mut Config),
) -> (AppState, Arc<MemoryPresenceStore>) {
    let mut config = test_config();
    tweak(&mut config);
    let store = Arc::new(MemoryPresenceStore::new());
    (AppState::new(config, store.clone()), store)
}

/// A fake socket: context for the handlers plus the receiver end that a
/// real connection's send task would drain.
pub(crate) fn socket_context() -> (SocketContext, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SocketContext {
            conn_id: Uuid::new_v4(),
            ip: Some("203.0.113.7".to_owned()),
            tx,
        },
        rx,
    )
}

/// Insert an already-authed connection straight into the registry.
pub(crate) async fn register_connection(
    state: &AppState,
    uuid: &str,
    name: &str,
) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn_id = Uuid::new_v4();
    let now = now_ms();
    state
        .registry
        .insert(
            conn_id,
            ConnectionState {
                uuid: uuid.to_owned(),
                name: name.to_owned(),
                account_type: AccountType::Local,
                roles: vec![Role::Member],
                connected_at: now,
                last_seen: now,
                last_keepalive_at: now,
                is_alive: true,
                ip: None,
                tx,
            },
        )
        .await;
    (conn_id, rx)
}

/// Everything queued on a fake socket. Sends are synchronous, so after the
/// handler under test returns, its output is already here.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Text frames only, parsed as JSON.
pub(crate) fn drain_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
    drain(rx)
        .into_iter()
        .filter_map(|msg| match msg {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        })
        .collect()
}

/// `(code, reason)` of every close frame in a drained batch.
pub(crate) fn close_frames(messages: &[Message]) -> Vec<(u16, String)> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            Message::Close(Some(frame)) => Some((frame.code, frame.reason.to_string())),
            _ => None,
        })
        .collect()
}
