//! Producer ingress: backends inject messages for clients over HTTP, next to
//! the bus subscription.

use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::envelope::Envelope;
use crate::gateway::router::RouteOutcome;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/publish", post(publish))
}

/// A backend producer. When `PRODUCER_TOKEN` is set, requests must carry it
/// as `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Copy)]
pub struct Producer;

impl FromRequestParts<AppState> for Producer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.producer_token.as_deref() else {
            return Ok(Producer);
        };

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;

        if token != expected {
            return Err(ApiError::unauthorized("Invalid producer token"));
        }
        Ok(Producer)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PublishResponse {
    /// How the gateway handled the message, e.g. `delivered` or `queued`.
    pub outcome: String,
    /// Endpoints the message was enqueued on.
    pub endpoints: usize,
}

// ---------------------------------------------------------------------------
// POST /api/v1/publish
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/publish",
    tag = "Producers",
    security(("bearer" = [])),
    request_body = Envelope,
    responses(
        (status = 200, description = "Message routed", body = PublishResponse),
        (status = 400, description = "Malformed envelope", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "No live endpoint for the recipient", body = ApiErrorBody),
    ),
)]
pub async fn publish(
    _producer: Producer,
    State(state): State<AppState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<PublishResponse>, ApiError> {
    let outcome = state.router.route_backend(envelope).await?;
    let (outcome, endpoints) = match outcome {
        RouteOutcome::Delivered { endpoints } => ("delivered", endpoints),
        RouteOutcome::Queued => ("queued", 0),
        RouteOutcome::Forwarded => ("forwarded", 0),
        RouteOutcome::Local => ("ignored", 0),
    };
    Ok(Json(PublishResponse {
        outcome: outcome.to_string(),
        endpoints,
    }))
}
