mod common;

use axum::http::{Method, StatusCode};
use presence_gateway::models::{AccountType, PresenceRecord, Role};
use serde_json::json;

use common::TEST_ADMIN_KEY;

fn authed() -> [(&'static str, &'static str); 1] {
    [("x-admin-key", TEST_ADMIN_KEY)]
}

fn online_record(uuid: &str, name: &str, last_seen: i64) -> PresenceRecord {
    PresenceRecord {
        uuid: uuid.to_owned(),
        name: name.to_owned(),
        account_type: AccountType::Local,
        roles: vec![Role::Member],
        online: true,
        last_join: Some(last_seen - 500),
        last_seen: Some(last_seen),
        last_leave: None,
    }
}

// ============================================================================
// GET /v1/health
// ============================================================================

#[tokio::test]
async fn health_is_open_and_reports_shape() {
    let (state, store) = common::test_state();
    store.seed(online_record("a1", "Alice", 1_000)).await;
    common::register_connection(&state, "a1", "Alice").await;
    common::register_connection(&state, "a1", "Alice").await; // second device
    let app = common::create_test_app(state);

    let (status, headers, body) = common::get_json(app, "/v1/health", &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["env"], "test");
    assert_eq!(body["connections"], 2);
    assert_eq!(body["uniqueUsers"], 1);
    assert_eq!(body["onlineUsers"], 1);
    assert!(body["startedAt"].as_i64().unwrap() > 0);
    assert!(body["uptimeMs"].as_i64().unwrap() >= 0);
    assert!(body["timestamp"].as_i64().unwrap() > 0);
    assert!(body["version"].is_string());
    // CORS headers ride every response.
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-credentials"], "true");
}

#[tokio::test]
async fn health_started_at_is_cached_across_requests() {
    let (state, _store) = common::test_state();
    let app = common::create_test_app(state);

    let (_, _, first) = common::get_json(app.clone(), "/v1/health", &[]).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (_, _, second) = common::get_json(app, "/v1/health", &[]).await;

    assert_eq!(first["startedAt"], second["startedAt"]);
    assert!(second["uptimeMs"].as_i64().unwrap() >= first["uptimeMs"].as_i64().unwrap());
}

#[tokio::test]
async fn health_degrades_when_the_store_is_down() {
    let (state, store) = common::test_state();
    store.set_failing(true);
    let app = common::create_test_app(state);

    let (status, _, body) = common::get_json(app, "/v1/health", &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    // The online count is omitted rather than fabricated.
    assert!(body.get("onlineUsers").is_none());
    // Fallback start time is the process boot, still a sane value.
    assert!(body["startedAt"].as_i64().unwrap() > 0);
}

// ============================================================================
// Authorization
// ============================================================================

#[tokio::test]
async fn admin_routes_reject_missing_or_wrong_key() {
    let (state, _store) = common::test_state();
    let app = common::create_test_app(state);

    let (status, _, body) = common::get_json(app.clone(), "/v1/connected-users", &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"success": false, "message": "Unauthorized"}));

    let (status, _, _) = common::get_json(
        app,
        "/v1/connected-users",
        &[("x-admin-key", "wrong-key-wrong-key")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unauthorized_broadcast_has_no_side_effect() {
    let (state, _store) = common::test_state();
    let (_id, mut rx) = common::register_connection(&state, "a1", "Alice").await;
    let app = common::create_test_app(state);

    let (status, _, _) = common::post_json(
        app,
        "/v1/broadcast",
        &[("x-admin-key", "not-the-right-key")],
        json!({"type": "banner", "payload": {"text": "hi"}}),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(common::drain_json(&mut rx).is_empty());
}

// ============================================================================
// GET /v1/connected-users
// ============================================================================

#[tokio::test]
async fn connected_users_prefers_the_store_listing() {
    let (state, store) = common::test_state();
    store.seed(online_record("a1", "Alice", 2_000)).await;
    store.seed(online_record("b1", "Bob", 3_000)).await;
    common::register_connection(&state, "a1", "Alice").await;
    let app = common::create_test_app(state);

    let (status, _, body) = common::get_json(app, "/v1/connected-users", &authed()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["connections"], 1);
    let users = body["users"].as_array().unwrap();
    assert_eq!(users.len(), 2);
    // Most recently seen first.
    assert_eq!(users[0]["uuid"], "b1");
    assert_eq!(users[0]["lastSeen"], 3_000);
    assert_eq!(users[0]["roles"], json!(["MEMBER"]));
    assert_eq!(users[1]["uuid"], "a1");
}

#[tokio::test]
async fn connected_users_falls_back_to_registry_and_dedups_devices() {
    let (state, store) = common::test_state();
    let (first, _rx1) = common::register_connection(&state, "a1", "Alice").await;
    let (_second, _rx2) = common::register_connection(&state, "a1", "Alice").await;
    common::register_connection(&state, "b1", "Bob").await;

    // Make the first socket the most recently seen one.
    let newest = presence_gateway::models::now_ms() + 10_000;
    state.registry.touch(first, newest).await;

    store.set_failing(true);
    let app = common::create_test_app(state);

    let (status, _, body) = common::get_json(app, "/v1/connected-users", &authed()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connections"], 3);
    let users = body["users"].as_array().unwrap();
    assert_eq!(users.len(), 2, "multi-device user appears once");
    assert_eq!(users[0]["uuid"], "a1");
    assert_eq!(users[0]["lastSeen"], newest);
}

// ============================================================================
// POST /v1/broadcast
// ============================================================================

#[tokio::test]
async fn broadcast_reaches_every_open_socket() {
    let (state, _store) = common::test_state();
    let (_a, mut rx_a) = common::register_connection(&state, "a1", "Alice").await;
    let (_b, mut rx_b) = common::register_connection(&state, "b1", "Bob").await;
    let app = common::create_test_app(state);

    let (status, _, body) = common::post_json(
        app,
        "/v1/broadcast",
        &authed(),
        json!({"type": "banner", "payload": {"text": "hi"}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true}));

    let expected = json!({"type": "banner", "text": "hi"});
    assert_eq!(common::drain_json(&mut rx_a), vec![expected.clone()]);
    assert_eq!(common::drain_json(&mut rx_b), vec![expected]);
}

#[tokio::test]
async fn broadcast_without_payload_sends_the_bare_type() {
    let (state, _store) = common::test_state();
    let (_a, mut rx) = common::register_connection(&state, "a1", "Alice").await;
    let app = common::create_test_app(state);

    let (status, _, _) =
        common::post_json(app, "/v1/broadcast", &authed(), json!({"type": "reload"})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(common::drain_json(&mut rx), vec![json!({"type": "reload"})]);
}

#[tokio::test]
async fn broadcast_rejects_missing_type_and_malformed_bodies() {
    let (state, _store) = common::test_state();
    let (_a, mut rx) = common::register_connection(&state, "a1", "Alice").await;
    let app = common::create_test_app(state);

    let (status, _, body) = common::post_json(
        app.clone(),
        "/v1/broadcast",
        &authed(),
        json!({"payload": {"text": "hi"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _, _) = common::post_json(
        app.clone(),
        "/v1/broadcast",
        &authed(),
        json!({"type": "   "}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = common::post_raw(app, "/v1/broadcast", &authed(), "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid broadcast payload");

    assert!(common::drain_json(&mut rx).is_empty());
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn admin_surface_is_rate_limited_per_ip() {
    let (state, _store) = common::test_state_with(|c| c.rate_limit_max = 2);
    let app = common::create_test_app(state);
    let headers = [
        ("x-admin-key", TEST_ADMIN_KEY),
        ("x-real-ip", "198.51.100.9"),
    ];

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let (status, _, _) =
            common::get_json(app.clone(), "/v1/connected-users", &headers).await;
        statuses.push(status);
    }

    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
            .count(),
        1
    );

    let (status, _, body) =
        common::get_json(app.clone(), "/v1/connected-users", &headers).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, json!({"success": false, "message": "Too many requests"}));

    // A different IP has its own bucket.
    let (status, _, _) = common::get_json(
        app,
        "/v1/connected-users",
        &[
            ("x-admin-key", TEST_ADMIN_KEY),
            ("x-real-ip", "198.51.100.10"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_bypasses_the_rate_limiter() {
    let (state, _store) = common::test_state_with(|c| c.rate_limit_max = 1);
    let app = common::create_test_app(state);

    for _ in 0..5 {
        let (status, _, _) = common::get_json(
            app.clone(),
            "/v1/health",
            &[("x-real-ip", "198.51.100.9")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}

// ============================================================================
// Preflight & fallback
// ============================================================================

#[tokio::test]
async fn options_preflight_returns_204_with_cors_headers() {
    let (state, _store) = common::test_state();
    let app = common::create_test_app(state);

    for path in ["/v1/broadcast", "/v1/health", "/nowhere"] {
        let (status, headers, _) =
            common::request(app.clone(), Method::OPTIONS, path, &[], None).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "OPTIONS {path}");
        assert_eq!(headers["access-control-allow-methods"], "GET, POST, OPTIONS");
    }
}

#[tokio::test]
async fn unknown_paths_get_404_with_cors_headers() {
    let (state, _store) = common::test_state();
    let app = common::create_test_app(state);

    let (status, headers, body) = common::get_json(app, "/v2/anything", &[]).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"success": false, "message": "Not found"}));
    assert_eq!(headers["access-control-allow-origin"], "*");
}
