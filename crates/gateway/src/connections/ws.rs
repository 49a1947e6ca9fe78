//! WebSocket endpoint for UI clients.
//!
//! Flow:
//! 1. Client connects to `/v1/ws?token=<pre-shared-token>`
//! 2. The connection registers an outbox; a writer task drains it to the
//!    socket, a reader loop feeds frames to the dispatcher
//! 3. Responses to this client's requests go back through its outbox as
//!    critical sends; broadcasts arrive via the registry

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::rpc::dispatch::RequestCtx;
use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Pre-shared client token; required when the token env var is set.
    pub token: Option<String>,
}

/// GET /v1/ws — upgrade to WebSocket.
///
/// Authentication: when the configured token env var is set and non-empty,
/// the `token` query param must match (constant-time). Unset → open access
/// (dev mode).
pub async fn client_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Ok(expected) = std::env::var(&state.config.server.token_env) {
        if !expected.is_empty() {
            let provided = query.token.as_deref().unwrap_or("");
            if !token_eq(provided, &expected) {
                return (
                    axum::http::StatusCode::UNAUTHORIZED,
                    "invalid or missing client token",
                )
                    .into_response();
            }
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (conn_id, mut outbox_rx, cancel) = match state.registry.register() {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!(error = %e, "connection rejected");
            let _ = ws_sink
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1013, // try again later
                    reason: "too many connections".into(),
                })))
                .await;
            return;
        }
    };

    // Writer task: drains the outbox to the socket. Any write error or a
    // cancellation (eviction, shutdown) ends the connection.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                frame = outbox_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader loop: one frame at a time, responses back through the outbox so
    // per-connection ordering holds.
    let ctx = RequestCtx { conn_id };
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if let Some(response) = state.dispatcher.dispatch_text(ctx, &text).await {
                    state.registry.send_critical(conn_id, response);
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                // Binary/ping/pong: axum answers WS-level pings itself.
            }
            Some(Err(e)) => {
                tracing::debug!(conn_id, error = %e, "socket read error");
                break;
            }
        }
    }

    state.registry.remove(conn_id);
    writer.abort();
    tracing::info!(conn_id, "client disconnected");
}
