use std::env;
use std::str::FromStr;

use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,

    #[error("ADMIN_KEY must be at least 16 characters")]
    AdminKeyTooShort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RunEnv {
    #[default]
    Development,
    Test,
    Production,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub run_env: RunEnv,
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// WebSocket upgrade path; always starts with `/`.
    pub ws_path: String,
    /// Shared secret for the admin surface; at least 16 characters.
    pub admin_key: String,
    pub heartbeat_interval_ms: u64,
    pub offline_after_ms: i64,
    pub rate_limit_window_ms: i64,
    pub rate_limit_max: u32,
    pub log_level: Option<String>,
    pub commit_hash: String,
    /// Non-positive (or unset) disables the verification loop.
    pub verify_interval_ms: i64,
    pub warp_status_enabled: bool,
}

const DEFAULT_WS_PATH: &str = "/websocket";
const DEFAULT_ADMIN_KEY: &str = "changeme-admin-key";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let ws_path = env::var("WS_PATH").unwrap_or_else(|_| DEFAULT_WS_PATH.to_string());
        let ws_path = if ws_path.starts_with('/') {
            ws_path
        } else {
            tracing::warn!(ws_path = %ws_path, "WS_PATH must start with '/'; using default");
            DEFAULT_WS_PATH.to_string()
        };

        let admin_key = env::var("ADMIN_KEY").unwrap_or_else(|_| DEFAULT_ADMIN_KEY.to_string());
        if admin_key.len() < 16 {
            return Err(ConfigError::AdminKeyTooShort);
        }

        Ok(Config {
            run_env: parsed_or_default("APP_ENV"),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parsed_or("PORT", 8080),
            database_url: env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?,
            ws_path,
            admin_key,
            heartbeat_interval_ms: parsed_or("WS_HEARTBEAT_INTERVAL", 30_000),
            offline_after_ms: parsed_or("OFFLINE_AFTER_MS", 120_000),
            rate_limit_window_ms: parsed_or("RATE_LIMIT_WINDOW_MS", 15_000),
            rate_limit_max: parsed_or("RATE_LIMIT_MAX", 100),
            log_level: env::var("LOG_LEVEL").ok(),
            commit_hash: env::var("COMMIT_HASH").unwrap_or_else(|_| "dev".to_string()),
            verify_interval_ms: parsed_or("VERIFY_INTERVAL_MS", 0),
            warp_status_enabled: parsed_or("WARP_STATUS_ENABLED", true),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse an env var, falling back to the given default when it is unset or
/// unparseable. Mis-typed values should degrade, not crash the process.
fn parsed_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parsed_or_default<T: FromStr + Default>(name: &str) -> T {
    parsed_or(name, T::default())
}
