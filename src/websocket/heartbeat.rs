use std::time::Duration;

use axum::extract::ws::Message;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{evict_connection, CLOSE_DELIVERY_FAILED, CLOSE_INACTIVITY, CLOSE_NOT_OPEN};
use crate::models::now_ms;
use crate::protocol::ServerMessage;
use crate::state::AppState;

/// How close to the tick boundary a keepalive may already be resent. Covers
/// timer jitter so a socket is not skipped for a whole extra period.
const KEEPALIVE_SLACK_MS: i64 = 250;

/// Start the keepalive sweep. The configured interval is clamped to the
/// 5–10 s band regardless of what the environment asked for.
pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    let tick_every = state.config.heartbeat_interval_ms.clamp(5_000, 10_000);
    tracing::info!(tick_every_ms = tick_every, "heartbeat loop started");

    let mut ticker = tokio::time::interval(Duration::from_millis(tick_every));
    // Sweeps run strictly one at a time on this task; a slow sweep delays
    // the next tick instead of stacking a burst behind it.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sweep(&state, tick_every as i64).await;
    }
}

/// One pass over a registry snapshot: evict dead and idle sockets, send
/// keepalives to the rest.
pub(crate) async fn sweep(state: &AppState, tick_every_ms: i64) {
    let now = now_ms();
    let keepalive = match serde_json::to_string(&ServerMessage::Keepalive) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize keepalive frame; this is a programming error");
            return;
        }
    };

    for (conn_id, conn) in state.registry.snapshot().await {
        if !conn.is_open() {
            evict_connection(state, conn_id, CLOSE_NOT_OPEN, "socket_not_open").await;
        } else if now - conn.last_seen > state.config.offline_after_ms {
            evict_connection(state, conn_id, CLOSE_INACTIVITY, "inactivity_timeout").await;
        } else if now - conn.last_keepalive_at >= tick_every_ms - KEEPALIVE_SLACK_MS {
            if conn.tx.send(Message::Text(keepalive.clone())).is_ok() {
                state.registry.record_keepalive(conn_id, now).await;
            } else {
                evict_connection(state, conn_id, CLOSE_DELIVERY_FAILED, "keepalive_failed").await;
            }
        }
    }
}
