use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::gateway::GatewayError;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            GatewayError::ConnectionClosed => StatusCode::GONE,
            GatewayError::UnsupportedTransport(_) | GatewayError::NoUsableTransport => {
                StatusCode::NOT_ACCEPTABLE
            }
            GatewayError::NegotiationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PollLimit => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::HandshakeInvalid(_)
            | GatewayError::HandshakeTimeout
            | GatewayError::UnauthenticatedMessage { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::NoRoute { .. } => StatusCode::NOT_FOUND,
            GatewayError::QueueOverflow { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Malformed(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.code(), err.to_string())
    }
}
