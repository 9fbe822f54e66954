//! Pull transports (long-poll, script-tag, plain polling) and the side-channel
//! every one-way transport uses for client-to-gateway traffic.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::connection::{CloseReason, ConnectionState, PullTicket};
use crate::gateway::envelope::Envelope;
use crate::gateway::lifecycle;
use crate::gateway::probe::open_with_fallback;
use crate::gateway::transport::{TransportAdapter, TransportKind};
use crate::gateway::GatewayError;
use crate::AppState;

use super::SessionQuery;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/transport/open", post(open))
        .route("/transport/{connection_id}/send", post(send))
        .route("/transport/{connection_id}/poll", get(poll))
        .route("/transport/{connection_id}/script", get(script))
        .route("/transport/{connection_id}/fetch", get(fetch))
        .route("/transport/{connection_id}", delete(close))
}

const DEFAULT_CALLBACK: &str = "callback";

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OpenQuery {
    /// `longpoll`, `script`, `polling`, or `auto` (default).
    pub kind: Option<String>,
    /// Client id from `/negotiate`; `auto` follows its cached order.
    pub client: Option<String>,
    pub session: Option<String>,
    /// `seq` of the last message received on a previous connection.
    pub ack: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpenResponse {
    pub connection_id: String,
    pub transport: TransportKind,
    /// How long the gateway holds a pull request, in milliseconds.
    pub hold_ms: u64,
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PullQuery {
    /// Client request id. Repeating a recent one returns the same batch,
    /// even while the first request is still held. A new id acknowledges the
    /// batches served before it.
    pub rid: Option<String>,
    /// Script-tag only: function wrapping the payload.
    pub callback: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PollResponse {
    pub connection_id: String,
    pub state: ConnectionState,
    pub messages: Vec<Envelope>,
}

// ---------------------------------------------------------------------------
// POST /transport/open
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/transport/open",
    tag = "Transports",
    params(OpenQuery),
    responses(
        (status = 201, description = "Pull connection opened", body = OpenResponse),
        (status = 406, description = "Kind unsupported or nothing usable", body = ApiErrorBody),
        (status = 503, description = "Connection limit reached", body = ApiErrorBody),
    ),
)]
pub async fn open(
    State(state): State<AppState>,
    Query(query): Query<OpenQuery>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<OpenResponse>), ApiError> {
    let session = SessionQuery {
        session: query.session,
        ack: query.ack,
    };
    let hint = session.session(&headers);

    let kind = query.kind.as_deref().map(str::trim).unwrap_or("auto");
    let conn = if kind.eq_ignore_ascii_case("auto") {
        let order: Vec<TransportKind> = query
            .client
            .as_deref()
            .and_then(|client| state.negotiation.get(client))
            .unwrap_or_else(|| TransportKind::PREFERENCE.to_vec())
            .into_iter()
            .filter(|k| k.is_pull())
            .collect();
        open_with_fallback(&state, &order, hint)?
    } else {
        let kind: TransportKind = kind.parse()?;
        if !kind.is_pull() {
            return Err(GatewayError::UnsupportedTransport(format!(
                "{kind} is opened through its own route"
            ))
            .into());
        }
        TransportAdapter::for_kind(kind, &state.config)?.open(&state, hint)?
    };
    conn.set_resume_point(session.resume_point(&headers));

    let hold = TransportAdapter::for_kind(conn.kind, &state.config)?
        .hold_time()
        .unwrap_or(Duration::ZERO);
    Ok((
        StatusCode::CREATED,
        Json(OpenResponse {
            connection_id: conn.id.clone(),
            transport: conn.kind,
            hold_ms: hold.as_millis() as u64,
            heartbeat_interval: state.config.heartbeat_interval.as_millis() as u64,
        }),
    ))
}

// ---------------------------------------------------------------------------
// POST /transport/:connection_id/send
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/transport/{connection_id}/send",
    tag = "Transports",
    params(("connection_id" = String, Path, description = "Connection ID")),
    request_body(content = String, description = "One envelope or a JSON array of envelopes", content_type = "application/json"),
    responses(
        (status = 202, description = "Frame accepted for processing"),
        (status = 400, description = "Connection has its own upstream", body = ApiErrorBody),
        (status = 404, description = "Unknown connection", body = ApiErrorBody),
        (status = 410, description = "Connection closed", body = ApiErrorBody),
    ),
)]
pub async fn send(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let conn = state.connections.require(&connection_id)?;
    if !conn.kind.needs_side_channel() {
        return Err(GatewayError::Malformed(format!(
            "{} connections send over their own socket",
            conn.kind
        ))
        .into());
    }
    let frame = String::from_utf8(body.to_vec())
        .map_err(|_| GatewayError::Malformed("body is not UTF-8".into()))?;

    TransportAdapter::for_kind(conn.kind, &state.config)?
        .receive(&conn, frame)
        .await?;
    lifecycle::connection_active(&conn);
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// GET /transport/:connection_id/{poll,script,fetch}
// ---------------------------------------------------------------------------

/// Serve one pull request on a connection of kind `expected`.
async fn pull(
    state: &AppState,
    connection_id: &str,
    expected: TransportKind,
    request_id: Option<String>,
) -> Result<PollResponse, ApiError> {
    let conn = state.connections.require(connection_id)?;
    if conn.kind != expected {
        return Err(GatewayError::Malformed(format!(
            "{} connection cannot be read as {expected}",
            conn.kind
        ))
        .into());
    }

    let batch = match conn.claim_request(request_id).await {
        PullTicket::Replay(messages) => {
            tracing::debug!(connection_id = %conn.id, "replaying duplicate pull");
            return Ok(PollResponse {
                connection_id: conn.id.clone(),
                state: conn.state(),
                messages,
            });
        }
        PullTicket::Fresh(batch) => batch,
    };

    let adapter = TransportAdapter::for_kind(conn.kind, &state.config)?;
    let _slot = conn.begin_poll(adapter.max_outstanding()).map_err(|e| {
        state.diagnostics.record(&e);
        e
    })?;
    conn.acknowledge_served();
    lifecycle::connection_active(&conn);

    let served = adapter
        .send(&conn, state.config.poll_batch_size)
        .await
        .unwrap_or_default();
    let messages = batch.finish(served);
    Ok(PollResponse {
        connection_id: conn.id.clone(),
        state: conn.state(),
        messages,
    })
}

#[utoipa::path(
    get,
    path = "/transport/{connection_id}/poll",
    tag = "Transports",
    params(("connection_id" = String, Path, description = "Connection ID"), PullQuery),
    responses(
        (status = 200, description = "Queued messages, possibly after holding", body = PollResponse),
        (status = 404, description = "Unknown connection", body = ApiErrorBody),
        (status = 429, description = "Too many outstanding polls", body = ApiErrorBody),
    ),
)]
pub async fn poll(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let batch = pull(&state, &connection_id, TransportKind::LongPoll, query.rid).await?;
    Ok(Json(batch))
}

#[utoipa::path(
    get,
    path = "/transport/{connection_id}/script",
    tag = "Transports",
    params(("connection_id" = String, Path, description = "Connection ID"), PullQuery),
    responses(
        (status = 200, description = "`callback({...});` wrapping a poll response", body = String, content_type = "application/javascript"),
        (status = 400, description = "Invalid callback name", body = ApiErrorBody),
        (status = 404, description = "Unknown connection", body = ApiErrorBody),
    ),
)]
pub async fn script(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Response, ApiError> {
    let callback = query
        .callback
        .unwrap_or_else(|| DEFAULT_CALLBACK.to_string());
    if !is_valid_callback(&callback) {
        return Err(ApiError::bad_request("Invalid callback name"));
    }

    let batch = pull(&state, &connection_id, TransportKind::ScriptTag, query.rid).await?;
    let json = serde_json::to_string(&batch).map_err(|e| ApiError::internal(e.to_string()))?;
    let mut response = format!("{callback}({json});").into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/transport/{connection_id}/fetch",
    tag = "Transports",
    params(("connection_id" = String, Path, description = "Connection ID"), PullQuery),
    responses(
        (status = 200, description = "Whatever is queued, possibly nothing", body = PollResponse),
        (status = 404, description = "Unknown connection", body = ApiErrorBody),
    ),
)]
pub async fn fetch(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let batch = pull(&state, &connection_id, TransportKind::Polling, query.rid).await?;
    Ok(Json(batch))
}

/// JavaScript identifier path such as `cb` or `app.handlers.cb_1`.
fn is_valid_callback(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

// ---------------------------------------------------------------------------
// DELETE /transport/:connection_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/transport/{connection_id}",
    tag = "Transports",
    params(("connection_id" = String, Path, description = "Connection ID")),
    responses(
        (status = 204, description = "Connection closed and its endpoint removed"),
        (status = 404, description = "Unknown connection", body = ApiErrorBody),
    ),
)]
pub async fn close(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let conn = state.connections.require(&connection_id)?;
    match conn.endpoint() {
        Some(endpoint) if endpoint.is_current(&conn) => {
            lifecycle::close_endpoint(&state, &endpoint, CloseReason::Normal)
        }
        _ => {
            conn.close(CloseReason::Normal);
        }
    }
    Ok(StatusCode::NO_CONTENT)
}
