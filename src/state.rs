use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::Config;
use crate::models::now_ms;
use crate::presence::PresenceStore;
use crate::rate_limit::RateLimiter;
use crate::websocket::ConnectionRegistry;

/// Shared application state passed to all handlers and background loops.
///
/// Everything inside is an `Arc` (or wraps one), so cloning per request is
/// inexpensive.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub presence: Arc<dyn PresenceStore>,
    pub registry: ConnectionRegistry,
    pub rate_limiter: RateLimiter,
    /// Persisted start time, read through from the store's health row at
    /// most once per process.
    pub started_at: Arc<OnceCell<i64>>,
    /// Process boot time; the health endpoint's fallback when the health
    /// row cannot be read (not cached, so a later request retries).
    pub boot_ms: i64,
}

impl AppState {
    pub fn new(config: Config, presence: Arc<dyn PresenceStore>) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms);
        Self {
            config: Arc::new(config),
            presence,
            registry: ConnectionRegistry::new(),
            rate_limiter,
            started_at: Arc::new(OnceCell::new()),
            boot_ms: now_ms(),
        }
    }
}
