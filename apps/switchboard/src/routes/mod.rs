pub mod health;
pub mod negotiate;
pub mod polling;
pub mod publish;
pub mod push;
pub mod socket;

use axum::http::HeaderMap;
use axum::Router;
use serde::Deserialize;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{IntoParams, Modify, OpenApi};

use crate::AppState;

/// Header carrying the session identifier out-of-band.
pub const SESSION_HEADER: &str = "x-session-id";

/// Sent by reconnecting event-stream clients.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(negotiate::router())
        .merge(socket::router())
        .merge(push::router())
        .merge(polling::router())
        .nest("/api/v1", publish::router())
}

/// Session identifier supplied with a transport-opening request.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SessionQuery {
    /// Session to validate at handshake time; `X-Session-Id` works too.
    pub session: Option<String>,
    /// `seq` of the last message received on a previous connection. Later
    /// messages that connection handed out are delivered again on resume.
    pub ack: Option<u64>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl SessionQuery {
    /// The query parameter wins over the header.
    pub fn session(&self, headers: &HeaderMap) -> Option<String> {
        self.session
            .as_deref()
            .or_else(|| header_str(headers, SESSION_HEADER))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// `ack` wins over `Last-Event-ID`.
    pub fn resume_point(&self, headers: &HeaderMap) -> Option<u64> {
        self.ack.or_else(|| {
            header_str(headers, LAST_EVENT_ID_HEADER).and_then(|v| v.trim().parse().ok())
        })
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        health::session_endpoints,
        // Negotiation
        negotiate::negotiate,
        // Push transports
        socket::websocket,
        push::eventstream,
        push::stream,
        // Pull transports and side-channel
        polling::open,
        polling::send,
        polling::poll,
        polling::script,
        polling::fetch,
        polling::close,
        // Producer ingress
        publish::publish,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::gateway::envelope::Envelope,
            crate::gateway::transport::TransportKind,
            crate::gateway::connection::ConnectionState,
            crate::gateway::diagnostics::DiagnosticsSnapshot,
            health::HealthResponse,
            health::EndpointSummary,
            crate::gateway::endpoint::EndpointStatus,
            negotiate::NegotiateResponse,
            polling::OpenResponse,
            polling::PollResponse,
            publish::PublishResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness and diagnostics"),
        (name = "Negotiation", description = "Transport capability discovery"),
        (name = "Transports", description = "Client transport endpoints"),
        (name = "Producers", description = "Backend message ingress"),
    )
)]
pub struct ApiDoc;
