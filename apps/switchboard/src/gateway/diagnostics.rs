//! Diagnostics sink: every scoped failure is counted and logged here.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use utoipa::ToSchema;

use super::error::GatewayError;

#[derive(Default)]
pub struct Diagnostics {
    negotiation_failed: AtomicU64,
    no_usable_transport: AtomicU64,
    handshake_invalid: AtomicU64,
    handshake_timeout: AtomicU64,
    unauthenticated_message: AtomicU64,
    no_route: AtomicU64,
    queue_overflow: AtomicU64,
    malformed: AtomicU64,
    poll_limit: AtomicU64,
    backend_unavailable: AtomicU64,
    superseded: AtomicU64,
    expired: AtomicU64,
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DiagnosticsSnapshot {
    pub negotiation_failed: u64,
    pub no_usable_transport: u64,
    pub handshake_invalid: u64,
    pub handshake_timeout: u64,
    pub unauthenticated_message: u64,
    pub no_route: u64,
    pub queue_overflow: u64,
    pub malformed: u64,
    pub poll_limit: u64,
    pub backend_unavailable: u64,
    pub superseded: u64,
    pub expired: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count and log a failure. Errors that are plain lookups (unknown or
    /// closed connection) are not counted.
    pub fn record(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::NegotiationFailed(_) | GatewayError::UnsupportedTransport(_) => {
                &self.negotiation_failed
            }
            GatewayError::NoUsableTransport => &self.no_usable_transport,
            GatewayError::HandshakeInvalid(_) => &self.handshake_invalid,
            GatewayError::HandshakeTimeout => &self.handshake_timeout,
            GatewayError::UnauthenticatedMessage { .. } => &self.unauthenticated_message,
            GatewayError::NoRoute { .. } => &self.no_route,
            GatewayError::QueueOverflow { .. } => &self.queue_overflow,
            GatewayError::Malformed(_) => &self.malformed,
            GatewayError::PollLimit => &self.poll_limit,
            GatewayError::BackendUnavailable(_) => &self.backend_unavailable,
            GatewayError::UnknownConnection(_) | GatewayError::ConnectionClosed => {
                tracing::debug!(code = err.code(), "{err}");
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match err {
            GatewayError::QueueOverflow { .. } | GatewayError::BackendUnavailable(_) => {
                tracing::warn!(code = err.code(), "{err}")
            }
            _ => tracing::debug!(code = err.code(), "{err}"),
        }
    }

    pub fn record_superseded(&self, connection_id: &str) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%connection_id, "connection superseded by resume");
    }

    pub fn record_expired(&self, endpoint_id: &str, discarded: usize) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%endpoint_id, discarded, "endpoint grace period expired");
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            negotiation_failed: get(&self.negotiation_failed),
            no_usable_transport: get(&self.no_usable_transport),
            handshake_invalid: get(&self.handshake_invalid),
            handshake_timeout: get(&self.handshake_timeout),
            unauthenticated_message: get(&self.unauthenticated_message),
            no_route: get(&self.no_route),
            queue_overflow: get(&self.queue_overflow),
            malformed: get(&self.malformed),
            poll_limit: get(&self.poll_limit),
            backend_unavailable: get(&self.backend_unavailable),
            superseded: get(&self.superseded),
            expired: get(&self.expired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_by_variant() {
        let diag = Diagnostics::new();
        diag.record(&GatewayError::NoRoute {
            recipient: "ses_1".into(),
        });
        diag.record(&GatewayError::NoRoute {
            recipient: "ses_2".into(),
        });
        diag.record(&GatewayError::QueueOverflow {
            endpoint_id: "ep_1".into(),
        });
        diag.record(&GatewayError::ConnectionClosed);
        diag.record_expired("ep_1", 3);

        let snap = diag.snapshot();
        assert_eq!(snap.no_route, 2);
        assert_eq!(snap.queue_overflow, 1);
        assert_eq!(snap.expired, 1);
        assert_eq!(snap.handshake_invalid, 0);
    }
}
