use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{evict_connection, send_frame, CLOSE_DELIVERY_FAILED, CLOSE_VERIFICATION_FAILED};
use crate::models::PresenceRecord;
use crate::protocol::ServerMessage;
use crate::state::AppState;

/// Verification never runs more often than once a minute, whatever the
/// environment says.
const MIN_INTERVAL_MS: i64 = 60_000;

/// Start the reconciliation sweep, or return `None` when it is disabled by
/// configuration.
pub fn spawn(state: AppState) -> Option<JoinHandle<()>> {
    if state.config.verify_interval_ms <= 0 {
        tracing::info!("verification loop disabled");
        return None;
    }
    Some(tokio::spawn(run(state)))
}

async fn run(state: AppState) {
    let interval_ms = state.config.verify_interval_ms.max(MIN_INTERVAL_MS) as u64;
    tracing::info!(interval_ms, "verification loop started");

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    // One sweep at a time on this task.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sweep(&state).await;
    }
}

/// Reconcile the registry against the store: anyone the store no longer
/// considers online, or whose identity has drifted, is cut loose. Everyone
/// else gets a `server.verify` receipt.
pub(crate) async fn sweep(state: &AppState) {
    let limit = state.registry.len().await.max(100);
    let records = match state.presence.fetch_online_users(limit).await {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, "fetch_online_users failed; skipping verification tick");
            return;
        }
    };

    let by_uuid: HashMap<&str, &PresenceRecord> =
        records.iter().map(|r| (r.uuid.as_str(), r)).collect();

    for (conn_id, conn) in state.registry.snapshot().await {
        if !conn.is_open() {
            evict_connection(
                state,
                conn_id,
                CLOSE_DELIVERY_FAILED,
                "verification_socket_not_open",
            )
            .await;
            continue;
        }

        match by_uuid.get(conn.uuid.as_str()) {
            None => {
                evict_connection(
                    state,
                    conn_id,
                    CLOSE_VERIFICATION_FAILED,
                    "verification_d1_offline",
                )
                .await;
            }
            Some(record) if !record.online => {
                evict_connection(
                    state,
                    conn_id,
                    CLOSE_VERIFICATION_FAILED,
                    "verification_d1_offline",
                )
                .await;
            }
            Some(record)
                if record.name != conn.name || record.account_type != conn.account_type =>
            {
                evict_connection(
                    state,
                    conn_id,
                    CLOSE_VERIFICATION_FAILED,
                    "verification_identity_mismatch",
                )
                .await;
            }
            Some(_) => {
                send_frame(
                    &conn.tx,
                    &ServerMessage::Verify {
                        uuid: conn.uuid.clone(),
                        last_seen: conn.last_seen,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_ms, AccountType, Role};
    use crate::test_support::{close_frames, drain, drain_json, register_connection, test_state};
    use serde_json::json;

    fn online_record(uuid: &str, name: &str) -> PresenceRecord {
        PresenceRecord {
            uuid: uuid.to_owned(),
            name: name.to_owned(),
            account_type: AccountType::Local,
            roles: vec![Role::Member],
            online: true,
            last_join: Some(now_ms()),
            last_seen: Some(now_ms()),
            last_leave: None,
        }
    }

    #[tokio::test]
    async fn matching_connection_receives_a_verify_receipt() {
        let (state, store) = test_state();
        let (conn_id, mut rx) = register_connection(&state, "a1", "Alice").await;
        store.seed(online_record("a1", "Alice")).await;

        sweep(&state).await;

        let last_seen = state.registry.get(conn_id).await.unwrap().last_seen;
        assert_eq!(
            drain_json(&mut rx),
            vec![json!({"type": "server.verify", "uuid": "a1", "lastSeen": last_seen})]
        );
    }

    #[tokio::test]
    async fn identity_mismatch_is_evicted_with_4403() {
        let (state, store) = test_state();
        let (conn_id, mut rx) = register_connection(&state, "c1", "Carol").await;
        let (_witness, mut rx_b) = register_connection(&state, "b1", "Bob").await;
        store.seed(online_record("c1", "Carolyn")).await;
        store.seed(online_record("b1", "Bob")).await;

        sweep(&state).await;

        assert!(state.registry.get(conn_id).await.is_none());
        assert_eq!(
            close_frames(&drain(&mut rx)),
            vec![(
                CLOSE_VERIFICATION_FAILED,
                "verification_identity_mismatch".to_owned()
            )]
        );
        assert!(drain_json(&mut rx_b)
            .iter()
            .any(|f| *f == json!({"type": "user.leave", "uuid": "c1"})));
    }

    #[tokio::test]
    async fn missing_or_offline_store_record_is_evicted() {
        let (state, store) = test_state();
        let (absent_id, mut rx_absent) = register_connection(&state, "ghost", "Ghost").await;
        let (offline_id, mut rx_offline) = register_connection(&state, "o1", "Olly").await;
        let mut record = online_record("o1", "Olly");
        record.online = false;
        store.seed(record).await;

        sweep(&state).await;

        assert!(state.registry.get(absent_id).await.is_none());
        assert!(state.registry.get(offline_id).await.is_none());
        for rx in [&mut rx_absent, &mut rx_offline] {
            let closes = close_frames(&drain(rx));
            assert_eq!(
                closes,
                vec![(
                    CLOSE_VERIFICATION_FAILED,
                    "verification_d1_offline".to_owned()
                )]
            );
        }
    }

    #[tokio::test]
    async fn empty_store_listing_clears_the_registry() {
        let (state, _store) = test_state();
        register_connection(&state, "a1", "Alice").await;
        register_connection(&state, "b1", "Bob").await;

        sweep(&state).await;

        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn store_failure_skips_the_tick_entirely() {
        let (state, store) = test_state();
        let (conn_id, mut rx) = register_connection(&state, "a1", "Alice").await;
        store.set_failing(true);

        sweep(&state).await;

        assert!(state.registry.get(conn_id).await.is_some());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn closed_socket_is_evicted_before_any_store_comparison() {
        let (state, store) = test_state();
        let (conn_id, rx) = register_connection(&state, "a1", "Alice").await;
        store.seed(online_record("a1", "Alice")).await;
        drop(rx);

        sweep(&state).await;

        assert!(state.registry.get(conn_id).await.is_none());
    }

    #[tokio::test]
    async fn disabled_interval_does_not_spawn_the_loop() {
        let (state, _store) = crate::test_support::test_state_with(|c| c.verify_interval_ms = 0);
        assert!(spawn(state).is_none());
    }
}
