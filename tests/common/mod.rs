// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    extract::ws::Message,
    http::{header, HeaderMap, Method, Request, StatusCode},
    middleware,
    routing::{get, post},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use tower_http::set_header::SetResponseHeaderLayer;
use uuid::Uuid;

use presence_gateway::{
    config::{Config, RunEnv},
    handlers::{self, admin},
    models::{now_ms, AccountType, Role},
    presence::MemoryPresenceStore,
    rate_limit::rate_limit_middleware,
    state::AppState,
    websocket::{websocket_handler, ConnectionState},
};

pub const TEST_ADMIN_KEY: &str = "test-admin-key-0123";

pub fn test_config() -> Config {
    Config {
        run_env: RunEnv::Test,
        host: "127.0.0.1".to_owned(),
        port: 0,
        database_url: "postgresql://unused".to_owned(),
        ws_path: "/websocket".to_owned(),
        admin_key: TEST_ADMIN_KEY.to_owned(),
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

pub fn test_state() -> (AppState, Arc<MemoryPresenceStore>) {
    test_state_with(|_| {})
}

pub fn test_state_with(tweak: impl FnOnce(&mut Config)) -> (AppState, Arc<MemoryPresenceStore>) {
    let mut config = test_config();
    tweak(&mut config);
    let store = Arc::new(MemoryPresenceStore::new());
    (AppState::new(config, store.clone()), store)
}

/// Build the application router the way `main` does, wired to the in-memory
/// store. The metrics route is deliberately absent; it is loopback-guarded
/// in production and meaningless under `oneshot`.
pub fn create_test_app(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/v1/connected-users",
            get(admin::connected_users).options(admin::preflight),
        )
        .route(
            "/v1/broadcast",
            post(admin::broadcast).options(admin::preflight),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    let ws_path = state.config.ws_path.clone();

    Router::new()
        .route(
            "/v1/health",
            get(handlers::health_check).options(admin::preflight),
        )
        .merge(admin_routes)
        .route(&ws_path, get(websocket_handler))
        .fallback(admin::fallback)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            axum::http::HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            axum::http::HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            axum::http::HeaderValue::from_static(
                "content-type, x-admin-key, x-forwarded-for, x-forwarded-proto",
            ),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            axum::http::HeaderValue::from_static("true"),
        ))
        .with_state(state)
}

/// Insert an authed connection straight into the registry, returning the
/// receiver its send task would drain.
pub async fn register_connection(
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

/// Text frames queued on a fake connection, parsed as JSON.
pub fn drain_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            if let Ok(value) = serde_json::from_str(&text) {
                out.push(value);
            }
        }
    }
    out
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.oneshot(request).await.expect("request failed");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

pub async fn request(
    app: Router,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    send(app, request).await
}

pub async fn get_json(
    app: Router,
    path: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Value) {
    request(app, Method::GET, path, headers, None).await
}

pub async fn post_json(
    app: Router,
    path: &str,
    headers: &[(&str, &str)],
    body: Value,
) -> (StatusCode, HeaderMap, Value) {
    request(app, Method::POST, path, headers, Some(body)).await
}

/// POST a raw (possibly malformed) body.
pub async fn post_raw(
    app: Router,
    path: &str,
    headers: &[(&str, &str)],
    body: &'static str,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    send(app, builder.body(Body::from(body)).unwrap()).await
}
