//! Server-push transports: event stream (SSE) and chunked streaming.
//!
//! Both are one-way. The first frame announces the connection id; the client
//! sends its handshake and everything else through the side-channel
//! `POST /transport/{connection_id}/send`.
//!
//! Every message carries its `seq` (the SSE event id). A reconnecting client
//! reports the last one it saw through `Last-Event-ID` or `?ack=`; anything
//! the dropped stream handed out after it is delivered again on resume.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, Stream, StreamExt};

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::connection::{CloseReason, Connection};
use crate::gateway::envelope::{ns, Envelope};
use crate::gateway::lifecycle;
use crate::gateway::transport::{TransportAdapter, TransportKind};
use crate::AppState;

use super::SessionQuery;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/transport/eventstream", get(eventstream))
        .route("/transport/stream", get(stream))
}

/// Reports the connection lost when the response body is dropped, which is
/// how a disconnected client shows up here.
struct StreamGuard {
    state: AppState,
    conn: Arc<Connection>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        lifecycle::connection_lost(&self.state, &self.conn, CloseReason::Lost);
    }
}

/// The `open` frame followed by the connection's outbound traffic, ending when
/// the connection closes.
fn outbound_stream(
    state: AppState,
    adapter: TransportAdapter,
    conn: Arc<Connection>,
) -> impl Stream<Item = Envelope> + Send {
    let open = Envelope::open(&conn.id, conn.kind.as_str());
    let guard = StreamGuard { state, conn };
    let tail = stream::unfold((adapter, guard), |(adapter, guard)| async move {
        let batch = adapter.send(&guard.conn, 1).await?;
        let envelopes = batch.into_iter().map(|item| item.envelope);
        Some((stream::iter(envelopes), (adapter, guard)))
    })
    .flatten();
    stream::once(async move { open }).chain(tail)
}

fn open_connection(
    state: &AppState,
    kind: TransportKind,
    query: SessionQuery,
    headers: &HeaderMap,
) -> Result<(TransportAdapter, Arc<Connection>), ApiError> {
    let adapter = TransportAdapter::for_kind(kind, &state.config)?;
    let conn = adapter.open(state, query.session(headers))?;
    conn.set_resume_point(query.resume_point(headers));
    Ok((adapter, conn))
}

// ---------------------------------------------------------------------------
// GET /transport/eventstream
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/transport/eventstream",
    tag = "Transports",
    params(SessionQuery),
    responses(
        (status = 200, description = "text/event-stream of envelopes; the first event is `open`"),
        (status = 406, description = "Event stream transport disabled", body = ApiErrorBody),
        (status = 503, description = "Connection limit reached", body = ApiErrorBody),
    ),
)]
pub async fn eventstream(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let (adapter, conn) = open_connection(&state, TransportKind::EventStream, query, &headers)?;
    let events = outbound_stream(state, adapter, conn).map(|envelope| {
        let event = Event::default();
        let event = if envelope.ns == ns::OPEN {
            event.event(ns::OPEN)
        } else {
            event
        };
        let event = match envelope.seq {
            Some(seq) => event.id(seq.to_string()),
            None => event,
        };
        event.json_data(&envelope)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// GET /transport/stream
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/transport/stream",
    tag = "Transports",
    params(SessionQuery),
    responses(
        (status = 200, description = "Chunked newline-delimited JSON envelopes; the first is `open`"),
        (status = 406, description = "Streaming transport disabled", body = ApiErrorBody),
        (status = 503, description = "Connection limit reached", body = ApiErrorBody),
    ),
)]
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (adapter, conn) = open_connection(&state, TransportKind::Streaming, query, &headers)?;
    let lines = outbound_stream(state, adapter, conn).map(|envelope| {
        let mut line = serde_json::to_string(&envelope).unwrap_or_default();
        line.push('\n');
        Ok::<_, Infallible>(line)
    });

    let mut response = Body::from_stream(lines).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}
