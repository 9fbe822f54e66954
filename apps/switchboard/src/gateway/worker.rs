//! Per-connection inbound worker.
//!
//! One task per connection consumes its inbound frames, enforces the
//! handshake deadline, handles control namespaces locally and hands
//! everything else to the router.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::AppState;

use super::connection::{CloseReason, Connection};
use super::envelope::{ns, parse_frame, Envelope};
use super::error::GatewayError;
use super::handshake;
use super::lifecycle;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub fn spawn(state: AppState, conn: Arc<Connection>, inbound: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(run(state, conn, inbound))
}

async fn run(state: AppState, conn: Arc<Connection>, mut inbound: mpsc::Receiver<String>) {
    let handshake_deadline = tokio::time::Instant::now() + state.config.handshake_timeout;

    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                if handle_frame(&state, &conn, &frame).await == Flow::Stop {
                    break;
                }
            }
            _ = tokio::time::sleep_until(handshake_deadline), if !conn.is_promoted() => {
                reject(&state, &conn, GatewayError::HandshakeTimeout, CloseReason::HandshakeTimeout);
                break;
            }
            _ = conn.closed() => break,
        }
    }

    lifecycle::connection_lost(&state, &conn, CloseReason::Lost);
    tracing::debug!(connection_id = %conn.id, "connection worker stopped");
}

async fn handle_frame(state: &AppState, conn: &Arc<Connection>, frame: &str) -> Flow {
    let envelopes = match parse_frame(frame) {
        Ok(envelopes) => envelopes,
        Err(err) => {
            report(state, conn, err);
            return Flow::Continue;
        }
    };
    for envelope in envelopes {
        if dispatch(state, conn, envelope).await == Flow::Stop {
            return Flow::Stop;
        }
    }
    Flow::Continue
}

async fn dispatch(state: &AppState, conn: &Arc<Connection>, envelope: Envelope) -> Flow {
    let namespace = envelope.ns.clone();
    match namespace.as_str() {
        ns::HANDSHAKE => {
            if conn.is_promoted() {
                report(
                    state,
                    conn,
                    GatewayError::HandshakeInvalid("handshake already completed".into()),
                );
                return Flow::Continue;
            }
            match handshake::handle_handshake(state, conn, envelope).await {
                Ok(_) => Flow::Continue,
                Err(err) => {
                    reject(state, conn, err, CloseReason::HandshakeInvalid);
                    Flow::Stop
                }
            }
        }
        ns::PING => {
            notify(state, conn, Envelope::pong(envelope.data));
            Flow::Continue
        }
        ns::CLOSE => {
            match conn.endpoint() {
                Some(endpoint) if endpoint.is_current(conn) => {
                    lifecycle::close_endpoint(state, &endpoint, CloseReason::Normal)
                }
                _ => {
                    conn.close(CloseReason::Normal);
                }
            }
            Flow::Stop
        }
        other if envelope.is_control() => {
            report(
                state,
                conn,
                GatewayError::Malformed(format!("namespace '{other}' is reserved")),
            );
            Flow::Continue
        }
        other => {
            let Some(endpoint) = conn.endpoint() else {
                report(
                    state,
                    conn,
                    GatewayError::UnauthenticatedMessage { ns: other.to_string() },
                );
                return Flow::Continue;
            };
            // The router records its own failures; only the client is told.
            if let Err(err) = state.router.route_from(&endpoint, envelope).await {
                notify(state, conn, Envelope::error(&err));
            }
            Flow::Continue
        }
    }
}

/// Queue a control message for the client, recording it if the control lane
/// was full.
pub fn notify(state: &AppState, conn: &Connection, envelope: Envelope) {
    if let Err(err) = conn.send_control(envelope) {
        state.diagnostics.record(&err);
    }
}

/// Record a failure and tell the client. The connection stays open.
fn report(state: &AppState, conn: &Connection, err: GatewayError) {
    state.diagnostics.record(&err);
    notify(state, conn, Envelope::error(&err));
}

/// Record a failure, tell the client, and close the connection.
fn reject(state: &AppState, conn: &Connection, err: GatewayError, reason: CloseReason) {
    tracing::info!(
        connection_id = %conn.id,
        code = err.code(),
        "connection rejected: {err}"
    );
    report(state, conn, err);
    conn.close(reason);
}
