pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod verify;

pub use handler::websocket_handler;
pub use registry::{ConnectionRegistry, ConnectionState};

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::state::AppState;

// Close codes. 4001 also covers the insecure-upgrade rejection band.
pub const CLOSE_NOT_OPEN: u16 = 4001;
pub const CLOSE_INACTIVITY: u16 = 4400;
pub const CLOSE_DELIVERY_FAILED: u16 = 4401;
pub const CLOSE_VERIFICATION_FAILED: u16 = 4403;

/// Send one already-serialized text frame, but only while the socket's
/// outbound channel is still open. Returns whether the frame was accepted.
pub(crate) fn safe_send_text(tx: &mpsc::UnboundedSender<Message>, text: String) -> bool {
    if tx.is_closed() {
        return false;
    }
    tx.send(Message::Text(text)).is_ok()
}

/// Serialize and send a single protocol frame to one socket. Serialization
/// and transport failures are logged, never propagated.
pub(crate) fn send_frame(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            if !safe_send_text(tx, text) {
                tracing::debug!("frame dropped; socket already closing");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server frame; this is a programming error");
        }
    }
}

/// Fan one already-serialized payload out to every open socket in the
/// registry. Per-socket failures are logged and never abort the fan-out.
pub async fn broadcast_text(state: &AppState, text: &str) {
    for (conn_id, conn) in state.registry.snapshot().await {
        if !conn.is_open() {
            continue;
        }
        if conn.tx.send(Message::Text(text.to_owned())).is_err() {
            tracing::debug!(conn_id = %conn_id, "broadcast send failed; socket closing");
        }
    }
}

/// Serialize a protocol frame once and broadcast it.
pub(crate) async fn broadcast_frame(state: &AppState, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => broadcast_text(state, &text).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize broadcast frame; this is a programming error");
        }
    }
}

/// Tear one connection down: drop it from the registry, flag the user
/// offline in the store, announce the departure, and close the socket.
///
/// Shared by the heartbeat and verification sweeps. Safe to race against
/// the close handler; whichever removes the registry entry first performs
/// the departure work, the other becomes a no-op.
pub(crate) async fn evict_connection(
    state: &AppState,
    conn_id: Uuid,
    code: u16,
    reason: &'static str,
) {
    let Some(conn) = state.registry.remove(conn_id).await else {
        return;
    };

    tracing::info!(conn_id = %conn_id, uuid = %conn.uuid, code, reason, "evicting connection");

    if let Err(e) = state.presence.mark_offline(&conn.uuid).await {
        tracing::warn!(uuid = %conn.uuid, error = %e, "mark_offline failed during eviction");
    }

    broadcast_frame(
        state,
        &ServerMessage::UserLeave {
            uuid: conn.uuid.clone(),
        },
    )
    .await;

    let close = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    if conn.tx.send(close).is_err() {
        tracing::debug!(conn_id = %conn_id, "close frame not delivered; socket already gone");
    }
}
