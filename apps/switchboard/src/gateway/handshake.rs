//! Handshake: bind a connection to a validated session and resource.
//!
//! A handshake for a (session, resource) that already has a live endpoint is
//! a resume: the new connection takes over the endpoint, the previous one is
//! superseded, and everything queued meanwhile is flushed after the ack.
//! Messages the previous connection handed out without a confirmed delivery
//! are queued again unless the client reports having received them.

use std::sync::Arc;

use serde::Deserialize;

use crate::auth::AuthError;
use crate::AppState;

use super::connection::{CloseReason, Connection};
use super::endpoint::Endpoint;
use super::envelope::{ns, Envelope};
use super::error::GatewayError;

#[derive(Debug, Default, Deserialize)]
struct HandshakeData {
    #[serde(default)]
    resource: Option<String>,
}

/// Result of a successful handshake.
pub struct Accepted {
    pub endpoint: Arc<Endpoint>,
    pub resumed: bool,
    /// Application messages waiting in the endpoint queue when the ack was sent.
    pub pending: usize,
}

/// The session named by the transport and by the envelope must agree; either
/// may be absent, not both.
fn resolve_session(hint: Option<&str>, envelope: Option<&str>) -> Result<String, GatewayError> {
    let hint = hint.map(str::trim).filter(|s| !s.is_empty());
    let envelope = envelope.map(str::trim).filter(|s| !s.is_empty());
    match (hint, envelope) {
        (Some(a), Some(b)) if a != b => Err(GatewayError::HandshakeInvalid(
            "session does not match the transport session".into(),
        )),
        (Some(s), _) | (None, Some(s)) => Ok(s.to_string()),
        (None, None) => Err(GatewayError::HandshakeInvalid("session is required".into())),
    }
}

fn resolve_resource(data: &serde_json::Value) -> Result<String, GatewayError> {
    let data: HandshakeData = serde_json::from_value(data.clone()).unwrap_or_default();
    data.resource
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| GatewayError::HandshakeInvalid("resource is required".into()))
}

/// Validate a `handshake` message and promote `conn` to an endpoint.
pub async fn handle_handshake(
    state: &AppState,
    conn: &Arc<Connection>,
    envelope: Envelope,
) -> Result<Accepted, GatewayError> {
    let session_id = resolve_session(conn.session_hint.as_deref(), envelope.session.as_deref())?;
    let resource = resolve_resource(&envelope.data)?;

    let info = state.auth.validate(&session_id).await.map_err(|e| match e {
        AuthError::Invalid => GatewayError::HandshakeInvalid("invalid or expired session".into()),
        AuthError::Unavailable(reason) => GatewayError::BackendUnavailable(reason),
    })?;

    if conn.is_closed() {
        return Err(GatewayError::ConnectionClosed);
    }

    let (endpoint, resumed, previous) = loop {
        let (endpoint, resumed) = state.directory.get_or_register(
            &info,
            &resource,
            state.config.outbound_queue_capacity,
        );
        // An endpoint that expired between lookup and attach is replaced on
        // the next lookup.
        if let Ok(previous) = endpoint.attach(conn.clone()) {
            break (endpoint, resumed, previous);
        }
    };

    if let Some(previous) = previous {
        if previous.close(CloseReason::Superseded) {
            state.diagnostics.record_superseded(&previous.id);
        }
    }

    if resumed {
        let outbox = endpoint.outbox();
        let stale = outbox.discard_control();
        let restored = outbox.restore_unacked(conn.resume_point());
        if stale > 0 || restored > 0 {
            tracing::debug!(
                endpoint_id = %endpoint.id,
                stale_control = stale,
                restored,
                resume_point = ?conn.resume_point(),
                "endpoint queue prepared for resume"
            );
        }
    }
    let pending = endpoint.outbox().pending();

    let mut ack = Envelope::new(
        ns::HANDSHAKE,
        serde_json::json!({
            "status": "ok",
            "endpoint_id": endpoint.id,
            "session": endpoint.session_id,
            "resource": endpoint.resource,
            "user_id": endpoint.user_id,
            "context_id": endpoint.context_id,
            "resumed": resumed,
            "pending": pending,
            "transport": conn.kind,
            "heartbeat_interval": state.config.heartbeat_interval.as_millis() as u64,
        }),
    );
    ack.session = Some(endpoint.session_id.clone());
    if let Err(err) = conn.promote(&endpoint, ack) {
        state.diagnostics.record(&err);
    }

    tracing::info!(
        connection_id = %conn.id,
        endpoint_id = %endpoint.id,
        session_id = %endpoint.session_id,
        resource = %endpoint.resource,
        transport = %conn.kind,
        resumed,
        pending,
        "handshake complete"
    );

    Ok(Accepted {
        endpoint,
        resumed,
        pending,
    })
}
