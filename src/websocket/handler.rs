use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{broadcast_frame, send_frame, ConnectionState};
use crate::handlers::shared::client_ip;
use crate::models::{now_ms, OnlineUser, DEFAULT_ROLE};
use crate::protocol::{
    normalize_account_type, normalize_role_list, normalize_roles, parse_client_frame, AuthPayload,
    ClientMessage, RolesUpdatePayload, ServerMessage, WarpStatusPayload,
};
use crate::state::AppState;

/// Per-socket attributes fixed at upgrade time, handed to every frame
/// handler. The connection id is the registry key; the client IP is
/// resolved once from the upgrade request's proxy headers.
#[derive(Clone)]
pub struct SocketContext {
    pub conn_id: Uuid,
    pub ip: Option<String>,
    pub tx: mpsc::UnboundedSender<Message>,
}

// ============================================================================
// Upgrade handler
// ============================================================================

/// GET on the configured WS path — upgrade to a WebSocket connection.
///
/// Plain-HTTP requests behind the proxy are rejected before the upgrade
/// (400); requests without a WebSocket upgrade header get 426.
pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(proto) = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        if !proto.trim().eq_ignore_ascii_case("https") {
            return (StatusCode::BAD_REQUEST, "Insecure connection").into_response();
        }
    }

    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    };

    let ip = client_ip(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, ip, state))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: WebSocket, ip: Option<String>, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let ctx = SocketContext {
        conn_id: Uuid::new_v4(),
        ip,
        tx,
    };

    // Outbound pump. Stops after forwarding a close frame so evictions by
    // the background sweeps reach the peer with their code and reason.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    // Inbound frames are handled sequentially; a slow store call delays
    // only this socket's next frame.
    let recv_state = state.clone();
    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&recv_state, &recv_ctx, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Axum echoes Ping frames transparently; Binary is not part
                // of the protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(
                        conn_id = %recv_ctx.conn_id,
                        error = ?e,
                        "WebSocket receive error; closing connection"
                    );
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    handle_close(&state, ctx.conn_id).await;
}

/// Departure path for sockets that close on their own. Idempotent against
/// the sweeps' eviction helper; whichever removes the entry first owns the
/// `mark_offline` and `user.leave` work.
pub(crate) async fn handle_close(state: &AppState, conn_id: Uuid) {
    let Some(conn) = state.registry.remove(conn_id).await else {
        return;
    };

    if let Err(e) = state.presence.mark_offline(&conn.uuid).await {
        tracing::warn!(uuid = %conn.uuid, error = %e, "mark_offline failed on disconnect");
    }

    broadcast_frame(state, &ServerMessage::UserLeave { uuid: conn.uuid }).await;
}

// ============================================================================
// Inbound dispatch
// ============================================================================

pub(crate) async fn handle_frame(state: &AppState, ctx: &SocketContext, text: &str) {
    let message = match parse_client_frame(text) {
        Ok(Some(message)) => message,
        Ok(None) => {
            tracing::info!(conn_id = %ctx.conn_id, "ignoring frame with unknown type");
            return;
        }
        Err(e) => {
            send_frame(&ctx.tx, &e.to_frame());
            return;
        }
    };

    match message {
        ClientMessage::Auth(payload) => handle_auth(state, ctx, payload).await,
        ClientMessage::Ping => handle_ping(state, ctx).await,
        ClientMessage::RolesUpdate(payload) => handle_roles_update(state, ctx, payload).await,
        ClientMessage::WarpStatus(payload) => handle_warp_status(state, ctx, payload).await,
    }

    // Any successfully dispatched frame counts as activity.
    state.registry.touch(ctx.conn_id, now_ms()).await;
}

// ============================================================================
// Protocol handlers
// ============================================================================

async fn handle_auth(state: &AppState, ctx: &SocketContext, payload: AuthPayload) {
    let now = now_ms();

    let uuid = match payload
        .uuid
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(uuid) => uuid.to_owned(),
        None => Uuid::new_v4().to_string(),
    };
    let name = match payload
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(name) => name.to_owned(),
        None => "Unknown".to_owned(),
    };
    let account_type = normalize_account_type(payload.account_type.as_deref());
    let hinted = normalize_roles(payload.roles.as_ref());

    // A re-auth under a different identity releases the previous one first.
    if let Some(previous) = state.registry.get(ctx.conn_id).await {
        if previous.uuid != uuid {
            if let Err(e) = state.presence.mark_offline(&previous.uuid).await {
                tracing::warn!(
                    uuid = %previous.uuid,
                    error = %e,
                    "mark_offline failed for replaced identity"
                );
            }
            broadcast_frame(
                state,
                &ServerMessage::UserLeave {
                    uuid: previous.uuid,
                },
            )
            .await;
        }
    }

    // Canonical store roles override client hints; hints apply only when
    // the store has nothing, and only then are they persisted.
    let store_roles = match state.presence.fetch_roles(&uuid).await {
        Ok(roles) => roles,
        Err(e) => {
            tracing::warn!(uuid = %uuid, error = %e, "fetch_roles failed; falling back to hint");
            None
        }
    };
    let store_had_roles = store_roles.is_some();
    let effective = store_roles
        .or_else(|| (!hinted.is_empty()).then_some(hinted))
        .unwrap_or_else(|| vec![DEFAULT_ROLE]);

    state
        .registry
        .insert(
            ctx.conn_id,
            ConnectionState {
                uuid: uuid.clone(),
                name: name.clone(),
                account_type,
                roles: effective.clone(),
                connected_at: now,
                last_seen: now,
                last_keepalive_at: now,
                is_alive: true,
                ip: ctx.ip.clone(),
                tx: ctx.tx.clone(),
            },
        )
        .await;

    let user = OnlineUser {
        uuid: uuid.clone(),
        name: name.clone(),
        account_type,
        roles: effective.clone(),
        ip: ctx.ip.clone(),
    };
    let roles_to_persist = (!store_had_roles).then_some(effective.as_slice());
    if let Err(e) = state.presence.mark_online(&user, roles_to_persist).await {
        tracing::warn!(uuid = %uuid, error = %e, "mark_online failed; continuing with in-memory state");
    }

    // auth.ok must reach the authenticating socket before its own join
    // broadcast; both travel the same channel, so program order suffices.
    send_frame(
        &ctx.tx,
        &ServerMessage::AuthOk {
            uuid: uuid.clone(),
            roles: effective,
        },
    );
    broadcast_frame(
        state,
        &ServerMessage::UserJoin {
            uuid,
            name,
            account_type,
        },
    )
    .await;
}

async fn handle_ping(state: &AppState, ctx: &SocketContext) {
    let Some(uuid) = state.registry.touch(ctx.conn_id, now_ms()).await else {
        return;
    };

    if let Err(e) = state.presence.update_last_seen(&uuid).await {
        tracing::warn!(uuid = %uuid, error = %e, "update_last_seen failed");
    }

    send_frame(&ctx.tx, &ServerMessage::Pong);
}

async fn handle_roles_update(state: &AppState, ctx: &SocketContext, payload: RolesUpdatePayload) {
    let roles = normalize_role_list(&payload.roles);
    if roles.is_empty() {
        return;
    }

    let Some(uuid) = state.registry.set_roles(ctx.conn_id, roles.clone()).await else {
        return;
    };

    if let Err(e) = state.presence.update_roles(&uuid, &roles).await {
        tracing::warn!(uuid = %uuid, error = %e, "update_roles failed");
    }

    broadcast_frame(state, &ServerMessage::UserRoles { uuid, roles }).await;
}

async fn handle_warp_status(state: &AppState, ctx: &SocketContext, payload: WarpStatusPayload) {
    if !state.config.warp_status_enabled {
        return;
    }

    let Some(conn) = state.registry.get(ctx.conn_id).await else {
        return;
    };

    let mut blob = match serde_json::to_value(&payload) {
        Ok(Value::Object(map)) => map,
        _ => return,
    };
    blob.insert("serverTimestamp".to_owned(), Value::from(now_ms()));

    let key = format!("warp:status:{}", conn.uuid);
    if let Err(e) = state
        .presence
        .put_warp_status(&key, &Value::Object(blob))
        .await
    {
        tracing::warn!(uuid = %conn.uuid, error = %e, "failed to persist warp status");
    }
}
