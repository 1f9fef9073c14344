//! WebSocket gateway
//!
//! `GET /ws?token=...` authenticates, upgrades and runs one client actor per
//! socket. Failed handshakes are upgraded and closed immediately with
//! 4001 (expired) or 4002 (invalid) so browsers can tell them apart.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{TokenVerifier, VerifyError};
use crate::client::{self, ClientHandle, ClientSettings, Disconnect};
use crate::hub::Hub;
use crate::protocol::ServerFrame;
use crate::ratelimit::RateLimiter;
use crate::session::ClientInfo;

/// Socket-level limits applied at upgrade
#[derive(Debug, Clone)]
pub struct SocketLimits {
    pub write_buffer_size: usize,
    pub max_message_size: usize,
}

/// Shared state of the HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    /// Inbound frame admission control
    pub limiter: Option<Arc<dyn RateLimiter>>,
    pub verifier: Arc<TokenVerifier>,
    pub client: ClientSettings,
    pub socket: SocketLimits,
    pub instance_id: String,
    /// Root token; every client actor runs under a child of it
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "instance_id": state.instance_id,
        "connections": state.hub.client_count(),
    }))
}

/// GET /ws
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ws = ws
        .write_buffer_size(state.socket.write_buffer_size)
        .max_message_size(state.socket.max_message_size);

    let claims = match params.token.or_else(|| bearer_token(&headers)) {
        Some(token) => state.verifier.verify(&token),
        None => Err(VerifyError::InvalidFormat),
    };

    match claims {
        Ok(claims) => {
            let user_agent = headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let info = ClientInfo::new(claims.sub, claims.sid, addr.ip().to_string(), user_agent);
            ws.on_upgrade(move |socket| serve_connection(socket, state, info))
        }
        Err(e) => {
            let code = e.close_code();
            let reason = e.to_string();
            warn!(remote = %addr, close_code = code, error = %reason, "handshake rejected");
            ws.on_upgrade(move |socket| reject(socket, code, reason))
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn reject(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Run one authenticated socket from registration to unregister
pub async fn serve_connection(socket: WebSocket, state: AppState, info: ClientInfo) {
    let (client, rx) = ClientHandle::new(info, state.client.outbound_capacity, &state.shutdown);
    let conn_id = client.connection_id().to_string();

    if let Err(e) = state.hub.register_client(&client).await {
        warn!(conn_id = %conn_id, user_id = %client.info().user_id, error = %e, "registration failed");
        client.shutdown();
        state.hub.unregister_client(&client).await;
        reject(socket, e.close_code(), e.to_string()).await;
        return;
    }

    let welcome = ServerFrame::Welcome {
        connection_id: conn_id.clone(),
    };
    if let Err(e) = client.send_frame(&welcome) {
        debug!(conn_id = %conn_id, error = %e, "welcome not queued");
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(client::write_pump(sink, rx, client.clone(), state.client.clone()));

    let reason = client::read_pump(stream, &client, &state.hub, state.limiter.as_deref(), &state.client).await;
    match &reason {
        Disconnect::Transport(e) => debug!(conn_id = %conn_id, error = %e, "connection lost"),
        Disconnect::IdleTimeout => info!(conn_id = %conn_id, "connection timed out"),
        other => debug!(conn_id = %conn_id, reason = ?other, "connection finished"),
    }

    client.shutdown();
    let _ = writer.await;
    state.hub.unregister_client(&client).await;
}
