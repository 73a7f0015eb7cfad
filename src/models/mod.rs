use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Milliseconds since the Unix epoch. All gateway timestamps use this clock.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Roles
// ============================================================================

/// Closed role set. The wire format and the store both carry roles as
/// SCREAMING_SNAKE_CASE strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Staff,
    Diamond,
    Gold,
    Member,
}

/// The role every user falls back to when no other role can be resolved.
pub const DEFAULT_ROLE: Role = Role::Member;

// ============================================================================
// Account types
// ============================================================================

/// Coarse client kind. Anything outside the closed set normalizes to `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    #[default]
    Local,
    Microsoft,
    Mojang,
}

// ============================================================================
// Presence records
// ============================================================================

/// A user record as the presence store reports it. Owned by the store; the
/// gateway only reads these during auth, verification, and admin listing.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub roles: Vec<Role>,
    pub online: bool,
    pub last_join: Option<i64>,
    pub last_seen: Option<i64>,
    pub last_leave: Option<i64>,
}

/// Identity written to the store when a connection authenticates.
#[derive(Debug, Clone)]
pub struct OnlineUser {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub roles: Vec<Role>,
    pub ip: Option<String>,
}

/// Row shape of `GET /v1/connected-users`, built either from store records
/// or from the in-memory registry fallback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUserDto {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub last_seen: i64,
    pub connected_at: i64,
    pub roles: Vec<Role>,
}
