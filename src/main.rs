use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use presence_gateway::config::{Config, RunEnv};
use presence_gateway::presence::{PostgresPresenceStore, PresenceStore};
use presence_gateway::rate_limit::rate_limit_middleware;
use presence_gateway::state::AppState;
use presence_gateway::websocket::{heartbeat, verify, websocket_handler};
use presence_gateway::handlers::{self, admin};

/// Middleware that restricts access to the metrics endpoint to loopback connections only.
///
/// When `ConnectInfo` is not available (e.g. in direct oneshot tests), access is
/// denied — the metrics route is not registered in the test app anyway, so this
/// branch is unreachable in practice.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn init_tracing(config: &Config) {
    let default_filter = match &config.log_level {
        Some(level) => format!("presence_gateway={level},tower_http=info,sqlx=warn"),
        None => "presence_gateway=info,tower_http=info,sqlx=warn".to_owned(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.parse().expect("Invalid log filter"));

    // JSON in production, human-readable in dev.
    if config.run_env == RunEnv::Production {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    // Load configuration — fatal if ADMIN_KEY is too short or DATABASE_URL
    // is missing.
    let config = Config::from_env().expect("Failed to load configuration");
    init_tracing(&config);

    info!(env = %config.run_env, commit = %config.commit_hash, "🚀 Presence gateway starting...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .expect("Failed to create database pool");

    // Auto-run pending migrations on startup.
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    info!("✅ Presence store migrations applied");

    let presence: Arc<dyn PresenceStore> = Arc::new(PostgresPresenceStore::new(pool));
    let state = AppState::new(config, presence);

    // Background loops. Each runs on its own task and synchronizes with the
    // request path only through the registry; they live as long as the
    // process.
    let _heartbeat = heartbeat::spawn(state.clone());
    let _verifier = verify::spawn(state.clone());

    // Prometheus metrics layer
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // Authed admin routes sit behind the fixed-window limiter; the health
    // endpoint and the WS upgrade do not.
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
    let addr = state.config.server_addr();

    let app = Router::new()
        .route(
            "/v1/health",
            get(handlers::health_check).options(admin::preflight),
        )
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .merge(admin_routes)
        // WebSocket gateway
        .route(&ws_path, get(websocket_handler))
        .fallback(admin::fallback)
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        // ── CORS response headers (origin *, admin headers allowed) ────────
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(
                "content-type, x-admin-key, x-forwarded-for, x-forwarded-proto",
            ),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        ))
        .with_state(state);

    info!(ws_path = %ws_path, "🎧 Gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>`
    // in request extensions, needed by the require_loopback middleware on
    // /metrics.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server failed to start");
}
