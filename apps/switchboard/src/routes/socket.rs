//! WebSocket transport: full-duplex, one socket per connection.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time;

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::connection::{CloseReason, Connection};
use crate::gateway::envelope::Envelope;
use crate::gateway::{lifecycle, worker};
use crate::gateway::transport::{TransportAdapter, TransportKind};
use crate::gateway::GatewayError;
use crate::AppState;

use super::SessionQuery;

pub fn router() -> Router<AppState> {
    Router::new().route("/transport/websocket", get(websocket))
}

// ---------------------------------------------------------------------------
// GET /transport/websocket
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/transport/websocket",
    tag = "Transports",
    params(SessionQuery),
    responses(
        (status = 101, description = "Switching to the WebSocket protocol"),
        (status = 406, description = "WebSocket transport disabled", body = ApiErrorBody),
        (status = 503, description = "Upgrade failed or connection limit reached", body = ApiErrorBody),
    ),
)]
pub async fn websocket(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|rejection| {
        tracing::debug!(%rejection, "websocket upgrade rejected");
        let err = GatewayError::NegotiationFailed(TransportKind::WebSocket);
        state.diagnostics.record(&err);
        ApiError::from(err)
    })?;

    let adapter = TransportAdapter::for_kind(TransportKind::WebSocket, &state.config)?;
    let conn = adapter.open(&state, query.session(&headers))?;
    conn.set_resume_point(query.resume_point(&headers));

    let failed_state = state.clone();
    let failed_conn = conn.clone();
    Ok(ws
        .on_failed_upgrade(move |e| {
            tracing::debug!(connection_id = %failed_conn.id, ?e, "websocket upgrade failed");
            failed_state
                .diagnostics
                .record(&GatewayError::NegotiationFailed(TransportKind::WebSocket));
            lifecycle::connection_lost(&failed_state, &failed_conn, CloseReason::Lost);
        })
        .on_upgrade(move |socket| handle_socket(socket, state, adapter, conn)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    adapter: TransportAdapter,
    conn: Arc<Connection>,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(adapter, conn.clone(), ws_tx));

    // The client sends a ping (or any frame) at least every heartbeat interval.
    let deadline = state.config.heartbeat_deadline();
    let reason = loop {
        let next = tokio::select! {
            next = time::timeout(deadline, ws_rx.next()) => next,
            _ = conn.closed() => break CloseReason::Lost,
        };
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %conn.id, ?e, "ws read error");
                break CloseReason::Lost;
            }
            Ok(None) => break CloseReason::Lost,
            Err(_) => {
                tracing::debug!(connection_id = %conn.id, "heartbeat timeout");
                break CloseReason::Lost;
            }
        };

        let text = match msg {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    let err = GatewayError::Malformed("binary frame is not UTF-8".into());
                    state.diagnostics.record(&err);
                    worker::notify(&state, &conn, Envelope::error(&err));
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                lifecycle::connection_active(&conn);
                continue;
            }
            Message::Close(_) => break CloseReason::Normal,
        };

        lifecycle::connection_active(&conn);
        if adapter.receive(&conn, text).await.is_err() {
            break CloseReason::Lost;
        }
    };

    // No-op for the close itself when something else closed the connection
    // first; still degrades the endpoint if this connection was carrying it.
    lifecycle::connection_lost(&state, &conn, reason);
    let _ = writer.await;
}

/// Drain the connection's outbound queue into the socket, then send the close
/// frame once the connection is closed.
async fn write_loop(
    adapter: TransportAdapter,
    conn: Arc<Connection>,
    mut ws_tx: SplitSink<WebSocket, Message>,
) {
    while let Some(batch) = adapter.send(&conn, 1).await {
        for item in batch {
            let json = match serde_json::to_string(&item.envelope) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(connection_id = %conn.id, ?e, "failed to encode envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                // Keep it for whichever connection resumes the endpoint.
                conn.requeue(item);
                conn.close(CloseReason::Lost);
                return;
            }
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::Normal);
    let _ = send_close(&mut ws_tx, reason.code(), reason.as_str()).await;
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
