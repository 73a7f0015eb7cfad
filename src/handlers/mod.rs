pub mod admin;
pub mod shared;

use std::collections::HashSet;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::models::now_ms;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub env: String,
    pub version: String,
    pub started_at: i64,
    pub uptime_ms: i64,
    pub timestamp: i64,
    /// Sockets currently registered on this instance.
    pub connections: usize,
    /// Online count per the store; omitted when the store is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_users: Option<u64>,
    /// Distinct uuids across this instance's sockets (multi-device counts
    /// once).
    pub unique_users: usize,
}

/// GET /v1/health — unauthenticated liveness and shape of the world.
///
/// `startedAt` comes from the store's health row, read through once per
/// process. When that read fails the response falls back to the process
/// boot time without caching it, so a later request retries the store.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = now_ms();
    let env = state.config.run_env.to_string();

    let started_at = match state
        .started_at
        .get_or_try_init(|| {
            state
                .presence
                .load_started_at(&env, &state.config.commit_hash, now)
        })
        .await
    {
        Ok(started_at) => *started_at,
        Err(e) => {
            tracing::warn!(error = %e, "health row unavailable; reporting process boot time");
            state.boot_ms
        }
    };

    let online_users = match state.presence.count_online_users().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "count_online_users failed");
            None
        }
    };

    let snapshot = state.registry.snapshot().await;
    let unique_users = snapshot
        .iter()
        .map(|(_, conn)| conn.uuid.as_str())
        .collect::<HashSet<_>>()
        .len();

    Json(HealthResponse {
        ok: true,
        env,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        started_at,
        uptime_ms: now - started_at,
        timestamp: now,
        connections: snapshot.len(),
        online_users,
        unique_users,
    })
}
