use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::handlers::shared::client_ip;
use crate::models::now_ms;
use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: i64,
}

/// Fixed-window request counter keyed by client IP.
///
/// Cheaply cloneable — all clones share the same bucket map via `Arc`.
/// Buckets are created lazily and replaced wholesale once their window has
/// elapsed; there is no background janitor.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    max: u32,
    window_ms: i64,
}

impl RateLimiter {
    pub fn new(max: u32, window_ms: i64) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            max,
            window_ms,
        }
    }

    pub async fn allow(&self, key: &str) -> bool {
        self.allow_at(key, now_ms()).await
    }

    async fn allow_at(&self, key: &str, now: i64) -> bool {
        let mut buckets = self.buckets.write().await;
        match buckets.get_mut(key) {
            Some(bucket) if bucket.reset_at >= now => {
                if bucket.count >= self.max {
                    return false;
                }
                bucket.count += 1;
                true
            }
            _ => {
                buckets.insert(
                    key.to_owned(),
                    Bucket {
                        count: 1,
                        reset_at: now + self.window_ms,
                    },
                );
                true
            }
        }
    }
}

/// Gate applied to the authed admin routes only; the WS upgrade and the
/// health endpoint bypass it.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_ip(req.headers()).unwrap_or_else(|| "unknown".to_owned());
    if state.rate_limiter.allow(&key).await {
        next.run(req).await
    } else {
        AppError::TooManyRequests.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exactly_one_rejection_for_max_plus_one_requests() {
        let limiter = RateLimiter::new(3, 15_000);
        let now = 1_000_000;

        let mut rejected = 0;
        for _ in 0..4 {
            if !limiter.allow_at("1.2.3.4", now).await {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let limiter = RateLimiter::new(2, 100);
        let now = 1_000_000;

        assert!(limiter.allow_at("ip", now).await);
        assert!(limiter.allow_at("ip", now).await);
        assert!(!limiter.allow_at("ip", now + 50).await);

        // reset_at = now + 100; one past it the bucket is replaced.
        assert!(limiter.allow_at("ip", now + 101).await);
        assert!(limiter.allow_at("ip", now + 102).await);
        assert!(!limiter.allow_at("ip", now + 103).await);
    }

    #[tokio::test]
    async fn keys_are_counted_independently() {
        let limiter = RateLimiter::new(1, 15_000);
        let now = 1_000_000;

        assert!(limiter.allow_at("a", now).await);
        assert!(limiter.allow_at("b", now).await);
        assert!(!limiter.allow_at("a", now).await);
    }
}
