//! Failure taxonomy of the gateway core.
//!
//! Every variant is scoped to one connection, endpoint or request; none of
//! them stops the process.

use super::transport::TransportKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The chosen transport could not be established.
    #[error("transport {0} could not be established")]
    NegotiationFailed(TransportKind),

    /// No candidate transport kind succeeded during negotiation.
    #[error("no usable transport")]
    NoUsableTransport,

    /// A single adapter refused; the caller falls back to the next kind.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Bad or expired session, or a malformed handshake.
    #[error("handshake rejected: {0}")]
    HandshakeInvalid(String),

    /// No handshake arrived within the allowed time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Application traffic before the handshake completed.
    #[error("message in namespace '{ns}' sent before handshake")]
    UnauthenticatedMessage { ns: String },

    /// The addressed recipient has no live endpoint.
    #[error("no route to {recipient}")]
    NoRoute { recipient: String },

    /// A bounded outbound queue evicted a message.
    #[error("outbound queue of {endpoint_id} overflowed")]
    QueueOverflow { endpoint_id: String },

    /// The frame is not a valid envelope.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Too many pull requests held on one connection.
    #[error("too many outstanding requests on connection")]
    PollLimit,

    #[error("unknown connection {0}")]
    UnknownConnection(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// The backend message bus refused the hand-off.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl GatewayError {
    /// Stable wire code carried in error control messages and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NegotiationFailed(_) => "NEGOTIATION_FAILED",
            GatewayError::NoUsableTransport => "NO_USABLE_TRANSPORT",
            GatewayError::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            GatewayError::HandshakeInvalid(_) => "HANDSHAKE_INVALID",
            GatewayError::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            GatewayError::UnauthenticatedMessage { .. } => "UNAUTHENTICATED_MESSAGE",
            GatewayError::NoRoute { .. } => "NO_ROUTE",
            GatewayError::QueueOverflow { .. } => "QUEUE_OVERFLOW",
            GatewayError::Malformed(_) => "MALFORMED",
            GatewayError::PollLimit => "POLL_LIMIT",
            GatewayError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            GatewayError::ConnectionClosed => "CONNECTION_CLOSED",
            GatewayError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
        }
    }

    /// Whether a caller should move on to the next transport kind.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            GatewayError::UnsupportedTransport(_) | GatewayError::NegotiationFailed(_)
        )
    }
}
