use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::models::{AccountType, Role};

// ============================================================================
// Client → server messages
// ============================================================================

/// Discriminated union of every frame a client may send, tagged by the
/// `type` field. Unknown `type` strings are not part of the union; see
/// [`parse_client_frame`], which reports them separately so the dispatcher
/// can ignore them without replying with an error frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth(AuthPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "roles.update")]
    RolesUpdate(RolesUpdatePayload),
    #[serde(rename = "warp.status")]
    WarpStatus(WarpStatusPayload),
}

/// Identity announcement. All fields are lenient: the auth handler generates
/// a fresh uuid, substitutes `Unknown`, and defaults the account type when
/// they are absent or empty. Validation only rejects shapes that cannot be
/// repaired (oversized name, oversized role hint list).
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub uuid: Option<String>,
    #[validate(custom(function = validate_name))]
    pub name: Option<String>,
    pub account_type: Option<String>,
    #[validate(custom(function = validate_role_hints))]
    pub roles: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RolesUpdatePayload {
    #[validate(length(min = 1, max = 8, message = "expected between 1 and 8 roles"))]
    pub roles: Vec<Value>,
}

/// Optional telemetry attached to a connection. Persisted verbatim to the
/// store's key/value side channel; none of it feeds back into the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WarpStatusPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 32, message = "at most 32 characters"))]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 32, message = "at most 32 characters"))]
    pub warp_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 256, message = "at most 256 characters"))]
    pub resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, message = "must be non-negative"))]
    pub warp_latency: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, message = "must be non-negative"))]
    pub session_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, message = "must be non-negative"))]
    pub lookup_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, message = "must be non-negative"))]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 256, message = "at most 256 characters"))]
    pub error: Option<String>,
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().chars().count() > 32 {
        let mut err = ValidationError::new("length");
        err.message = Some("at most 32 characters after trimming".into());
        return Err(err);
    }
    Ok(())
}

fn validate_role_hints(roles: &Value) -> Result<(), ValidationError> {
    if let Value::Array(items) = roles {
        if items.len() > 8 {
            let mut err = ValidationError::new("length");
            err.message = Some("at most 8 role hints".into());
            return Err(err);
        }
    }
    Ok(())
}

// ============================================================================
// Server → client messages
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth.ok")]
    AuthOk { uuid: String, roles: Vec<Role> },
    #[serde(rename = "user.join")]
    UserJoin {
        uuid: String,
        name: String,
        #[serde(rename = "accountType")]
        account_type: AccountType,
    },
    #[serde(rename = "user.leave")]
    UserLeave { uuid: String },
    #[serde(rename = "user.roles")]
    UserRoles { uuid: String, roles: Vec<Role> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "server.keepalive")]
    Keepalive,
    #[serde(rename = "server.verify")]
    Verify {
        uuid: String,
        #[serde(rename = "lastSeen")]
        last_seen: i64,
    },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Vec<String>>,
    },
}

// ============================================================================
// Parsing & validation
// ============================================================================

pub const CODE_INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";

/// A protocol-level rejection of an inbound frame. Sent back as a single
/// `error` frame; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: &'static str,
    pub message: String,
    pub details: Vec<String>,
}

impl ProtocolError {
    fn invalid_payload(details: Vec<String>) -> Self {
        Self {
            code: CODE_INVALID_PAYLOAD,
            message: "Invalid message payload".to_owned(),
            details,
        }
    }

    pub fn to_frame(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code.to_owned(),
            message: self.message.clone(),
            details: if self.details.is_empty() {
                None
            } else {
                Some(self.details.clone())
            },
        }
    }
}

/// Parse one inbound text frame.
///
/// - `Ok(Some(msg))`: a known, validated message.
/// - `Ok(None)`: syntactically fine JSON whose `type` is not part of the
///   union; the dispatcher logs it at info and moves on.
/// - `Err(_)`: malformed JSON, missing discriminator, wrong field types, or
///   a validation failure; answered with an `error` frame.
pub fn parse_client_frame(text: &str) -> Result<Option<ClientMessage>, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::invalid_payload(vec![e.to_string()]))?;

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::invalid_payload(vec![
            "type: required discriminator field".to_owned(),
        ]));
    };

    if !matches!(kind, "auth" | "ping" | "roles.update" | "warp.status") {
        return Ok(None);
    }

    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|e| ProtocolError::invalid_payload(vec![e.to_string()]))?;

    match &message {
        ClientMessage::Auth(p) => check(p)?,
        ClientMessage::RolesUpdate(p) => check(p)?,
        ClientMessage::WarpStatus(p) => check(p)?,
        ClientMessage::Ping => {}
    }

    Ok(Some(message))
}

fn check<T: Validate>(payload: &T) -> Result<(), ProtocolError> {
    payload
        .validate()
        .map_err(|e| ProtocolError::invalid_payload(issues(&e)))
}

/// Flatten [`ValidationErrors`] into one human-readable issue per failed
/// check, `field: message` shaped, for the `error` frame `details` array.
fn issues(errors: &ValidationErrors) -> Vec<String> {
    let mut out: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |err| match &err.message {
                Some(msg) => format!("{field}: {msg}"),
                None => format!("{field}: {}", err.code),
            })
        })
        .collect();
    out.sort();
    out
}

// ============================================================================
// Normalization
// ============================================================================

/// Canonicalize a role hint value: upper-cased, trimmed, deduplicated, kept
/// in first-occurrence order, restricted to the closed role set. Anything
/// that is not an array (including absence) yields an empty list.
pub fn normalize_roles(input: Option<&Value>) -> Vec<Role> {
    match input {
        Some(Value::Array(items)) => normalize_role_list(items),
        _ => Vec::new(),
    }
}

/// Array-form counterpart of [`normalize_roles`]; non-string elements are
/// dropped, as are strings outside the role set.
pub fn normalize_role_list(items: &[Value]) -> Vec<Role> {
    let mut out = Vec::new();
    for item in items {
        let Some(raw) = item.as_str() else { continue };
        let Ok(role) = Role::from_str(raw.trim().to_uppercase().as_str()) else {
            continue;
        };
        if !out.contains(&role) {
            out.push(role);
        }
    }
    out
}

/// Canonicalize an account-type string; anything outside the closed set
/// (or absent) maps to [`AccountType::Local`].
pub fn normalize_account_type(input: Option<&str>) -> AccountType {
    input
        .map(|s| s.trim().to_uppercase())
        .and_then(|s| AccountType::from_str(&s).ok())
        .unwrap_or_default()
}
