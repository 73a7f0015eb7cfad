use std::collections::HashMap;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{request::Parts, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};
use crate::models::ConnectedUserDto;
use crate::state::AppState;
use crate::websocket::broadcast_text;

// ============================================================================
// Authorization
// ============================================================================

/// Proof that the request carried the configured admin key.
///
/// The only constructor is the extractor, which runs before any body
/// extractor, so an unauthorized request is rejected before it can cause any
/// side effect. The comparison is constant-time.
pub struct AdminKey;

#[async_trait]
impl FromRequestParts<AppState> for AdminKey {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let provided = parts
            .headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if bool::from(provided.as_bytes().ct_eq(state.config.admin_key.as_bytes())) {
            Ok(AdminKey)
        } else {
            Err(AppError::Unauthorized)
        }
    }
}

// ============================================================================
// GET /v1/connected-users
// ============================================================================

/// Listing is store-first so multi-instance deployments see the whole
/// picture; when the store is down we degrade to what this instance knows.
pub async fn connected_users(State(state): State<AppState>, _key: AdminKey) -> Json<Value> {
    let users = match state.presence.fetch_online_users(500).await {
        Ok(records) => records
            .into_iter()
            .map(|r| ConnectedUserDto {
                uuid: r.uuid,
                name: r.name,
                account_type: r.account_type,
                last_seen: r.last_seen.unwrap_or(0),
                connected_at: r.last_join.or(r.last_seen).unwrap_or(0),
                roles: r.roles,
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "fetch_online_users failed; serving registry projection");
            registry_projection(&state).await
        }
    };

    let connections = state.registry.len().await;
    Json(json!({ "success": true, "users": users, "connections": connections }))
}

/// Dedup the registry by uuid, keeping the socket seen most recently;
/// multi-device users appear once.
async fn registry_projection(state: &AppState) -> Vec<ConnectedUserDto> {
    let mut best: HashMap<String, ConnectedUserDto> = HashMap::new();
    for (_, conn) in state.registry.snapshot().await {
        let candidate = ConnectedUserDto {
            uuid: conn.uuid.clone(),
            name: conn.name,
            account_type: conn.account_type,
            last_seen: conn.last_seen,
            connected_at: conn.connected_at,
            roles: conn.roles,
        };
        match best.get(&conn.uuid) {
            Some(existing) if existing.last_seen >= candidate.last_seen => {}
            _ => {
                best.insert(conn.uuid, candidate);
            }
        }
    }

    let mut users: Vec<ConnectedUserDto> = best.into_values().collect();
    users.sort_by_key(|u| std::cmp::Reverse(u.last_seen));
    users
}

// ============================================================================
// POST /v1/broadcast
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: Option<Value>,
}

/// Inject one frame into every open socket. The frame is the `payload`
/// object (or `{}`) with `type` spliced in, serialized once.
pub async fn broadcast(
    State(state): State<AppState>,
    _key: AdminKey,
    body: Result<Json<BroadcastRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) =
        body.map_err(|_| AppError::BadRequest("Invalid broadcast payload".to_owned()))?;

    let kind = request
        .kind
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("Broadcast requires a non-empty 'type'".to_owned()))?;

    let mut frame = match request.payload {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    frame.insert("type".to_owned(), Value::String(kind.to_owned()));

    let text = Value::Object(frame).to_string();
    tracing::info!(kind, "admin broadcast");
    broadcast_text(&state, &text).await;

    Ok(Json(json!({ "success": true })))
}

// ============================================================================
// Preflight & fallback
// ============================================================================

/// OPTIONS on any route: the CORS headers ride the response layer; the
/// handler only supplies the 204.
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        AppError::NotFound.into_response()
    }
}
