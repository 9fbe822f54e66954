use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::diagnostics::DiagnosticsSnapshot;
use crate::gateway::endpoint::{Endpoint, EndpointStatus};
use crate::gateway::transport::TransportKind;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/{session_id}", get(session_endpoints))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub sessions: usize,
    pub endpoints: usize,
    pub degraded_endpoints: usize,
    pub cached_negotiations: usize,
    pub diagnostics: DiagnosticsSnapshot,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Gateway is serving", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let counts = state.directory.counts();
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connections.len(),
        sessions: counts.sessions,
        endpoints: counts.endpoints,
        degraded_endpoints: counts.degraded,
        cached_negotiations: state.negotiation.len(),
        diagnostics: state.diagnostics.snapshot(),
    })
}

/// One live endpoint of a session.
#[derive(Debug, Serialize, ToSchema)]
pub struct EndpointSummary {
    pub endpoint_id: String,
    pub resource: String,
    pub user_id: String,
    pub status: EndpointStatus,
    pub connected_at: DateTime<Utc>,
    pub connection_id: Option<String>,
    pub transport: Option<TransportKind>,
    /// Messages waiting in the outbound queue.
    pub queued: usize,
}

impl From<&Endpoint> for EndpointSummary {
    fn from(endpoint: &Endpoint) -> Self {
        let connection = endpoint.connection();
        Self {
            endpoint_id: endpoint.id.clone(),
            resource: endpoint.resource.clone(),
            user_id: endpoint.user_id.clone(),
            status: endpoint.status(),
            connected_at: endpoint.connected_at,
            connection_id: connection.as_ref().map(|c| c.id.clone()),
            transport: connection.as_ref().map(|c| c.kind),
            queued: endpoint.outbox().len(),
        }
    }
}

// ---------------------------------------------------------------------------
// GET /sessions/:session_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/sessions/{session_id}",
    tag = "Health",
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Live endpoints of the session", body = Vec<EndpointSummary>),
        (status = 404, description = "Session has no live endpoint", body = ApiErrorBody),
    ),
)]
pub async fn session_endpoints(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<EndpointSummary>>, ApiError> {
    let mut endpoints: Vec<EndpointSummary> = state
        .directory
        .lookup(&session_id)
        .iter()
        .map(|endpoint| EndpointSummary::from(endpoint.as_ref()))
        .collect();
    if endpoints.is_empty() {
        return Err(ApiError::not_found("Session has no live endpoint"));
    }
    endpoints.sort_by(|a, b| a.resource.cmp(&b.resource));
    Ok(Json(endpoints))
}
