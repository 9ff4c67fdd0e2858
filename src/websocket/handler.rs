//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and hands each established socket to
//! the hub's ingress loop.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header::ORIGIN, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use std::sync::Arc;

use super::connection::WebSocketHandle;
use crate::api::{ApiError, AppState};
use crate::hub::{run_ingress, BroadcastHub, ConnectionHandle, DecodePolicy, Inbound};

/// Middleware rejecting upgrade requests from origins that are not allowed
pub async fn require_allowed_origin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request.headers().get(ORIGIN);
    if !origin_allowed(&state.config.server.allowed_origins, origin) {
        let origin = origin
            .and_then(|o| o.to_str().ok())
            .unwrap_or("<invalid>")
            .to_string();
        return ApiError::Forbidden(format!("origin {} is not allowed", origin)).into_response();
    }

    next.run(request).await
}

/// WebSocket upgrade handler
///
/// A failed upgrade only affects the requesting client.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = Arc::clone(&state.hub);
    let policy = state.config.server.decode_policy;

    ws.write_buffer_size(state.config.server.write_buffer_size)
        .on_failed_upgrade(|e| {
            tracing::warn!(error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, hub, policy))
}

/// Run one established WebSocket connection to completion
async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>, policy: DecodePolicy) {
    let (sink, stream) = socket.split();
    let handle = Arc::new(WebSocketHandle::new(sink));
    let id = handle.id();

    tracing::debug!(handle_id = %id, "WebSocket connected");

    let inbound = stream.map(|frame| frame.map(inbound_frame));
    let outcome = run_ingress(hub, handle, inbound, policy).await;

    tracing::debug!(handle_id = %id, outcome = ?outcome, "WebSocket closed");
}

fn inbound_frame(frame: WsMessage) -> Inbound {
    match frame {
        WsMessage::Text(text) => Inbound::Text(text),
        WsMessage::Close(_) => Inbound::Close,
        // Axum answers pings itself; binary frames carry no chat messages
        WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) => Inbound::Other,
    }
}

/// Check a request's `Origin` header against the allowed list.
///
/// An empty list or `"*"` allows everything. Requests without an `Origin`
/// header come from non-browser clients and are allowed.
pub fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }

    let Some(origin) = origin else {
        return true;
    };

    match origin.to_str() {
        Ok(origin) => allowed
            .iter()
            .any(|a| a.trim_end_matches('/').eq_ignore_ascii_case(origin)),
        Err(_) => false,
    }
}
