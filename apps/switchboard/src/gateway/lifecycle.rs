//! Endpoint lifecycle after the handshake: degradation, recovery, grace
//! expiry, explicit close, and the periodic liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::AppState;

use super::connection::{CloseReason, Connection, ConnectionState};
use super::endpoint::Endpoint;

/// How long a CLOSED connection stays in the table so late side-channel
/// requests can still see its state.
const CLOSED_LINGER: Duration = Duration::from_secs(5);

/// The transport under `conn` ended or failed. If `conn` was carrying an
/// endpoint, the endpoint is DEGRADED and its grace period starts.
pub fn connection_lost(state: &AppState, conn: &Arc<Connection>, reason: CloseReason) {
    if conn.close(reason) {
        tracing::info!(
            connection_id = %conn.id,
            transport = %conn.kind,
            reason = reason.as_str(),
            "connection closed"
        );
    }
    if let Some(endpoint) = conn.endpoint() {
        if endpoint.is_current(conn) {
            degrade_endpoint(state, &endpoint);
        }
    }
}

/// A pull connection stopped polling: OPEN → DEGRADED for both the connection
/// and its endpoint.
pub fn degrade_connection(state: &AppState, conn: &Arc<Connection>) {
    if !conn.degrade() {
        return;
    }
    tracing::info!(
        connection_id = %conn.id,
        transport = %conn.kind,
        idle_ms = conn.idle_for().as_millis() as u64,
        "connection degraded"
    );
    if let Some(endpoint) = conn.endpoint() {
        if endpoint.is_current(conn) {
            degrade_endpoint(state, &endpoint);
        }
    }
}

/// Client activity on `conn`: a DEGRADED connection recovers, and so does its
/// endpoint.
pub fn connection_active(conn: &Arc<Connection>) {
    conn.touch();
    if !conn.recover() {
        return;
    }
    if let Some(endpoint) = conn.endpoint() {
        if endpoint.is_current(conn) && endpoint.mark_open() {
            tracing::info!(
                connection_id = %conn.id,
                endpoint_id = %endpoint.id,
                "endpoint recovered"
            );
        }
    }
}

/// OPEN → DEGRADED and arm the grace timer. Messages keep queueing meanwhile.
pub fn degrade_endpoint(state: &AppState, endpoint: &Arc<Endpoint>) {
    if !endpoint.mark_degraded() {
        return;
    }
    let weak = Arc::downgrade(endpoint);
    let expiry_state = state.clone();
    endpoint.grace().arm(state.config.grace_period, async move {
        if let Some(endpoint) = weak.upgrade() {
            endpoint.grace().disarm();
            expire_endpoint(&expiry_state, &endpoint);
        }
    });
    tracing::info!(
        endpoint_id = %endpoint.id,
        session_id = %endpoint.session_id,
        grace_secs = state.config.grace_period.as_secs(),
        queued = endpoint.outbox().len(),
        "endpoint degraded"
    );
}

/// Grace period elapsed without a reconnect: remove the endpoint and discard
/// what is still queued. A reconnect that won the race leaves it untouched.
pub fn expire_endpoint(state: &AppState, endpoint: &Arc<Endpoint>) {
    let Some(connection) = endpoint.close_if_degraded() else {
        return;
    };
    state.directory.unregister(endpoint);
    let discarded = endpoint.outbox().clear();
    if let Some(conn) = connection {
        conn.close(CloseReason::Expired);
    }
    state.diagnostics.record_expired(&endpoint.id, discarded);
}

/// Explicit close: remove the endpoint immediately.
pub fn close_endpoint(state: &AppState, endpoint: &Arc<Endpoint>, reason: CloseReason) {
    let Some(connection) = endpoint.mark_closed() else {
        return;
    };
    endpoint.grace().cancel();
    state.directory.unregister(endpoint);
    let discarded = endpoint.outbox().clear();
    if let Some(conn) = connection {
        conn.close(reason);
    }
    tracing::info!(
        endpoint_id = %endpoint.id,
        session_id = %endpoint.session_id,
        discarded,
        "endpoint closed"
    );
}

/// One liveness pass over every connection.
pub fn sweep(state: &AppState) {
    let idle_limit = state.config.poll_idle_limit();
    for conn in state.connections.snapshot() {
        match conn.state() {
            ConnectionState::Closed => {
                if conn.idle_for() >= CLOSED_LINGER {
                    state.connections.remove(&conn.id);
                }
            }
            ConnectionState::Open
                if conn.kind.is_pull()
                    && conn.outstanding() == 0
                    && conn.idle_for() >= idle_limit =>
            {
                if conn.is_promoted() {
                    degrade_connection(state, &conn);
                } else {
                    connection_lost(state, &conn, CloseReason::Lost);
                }
            }
            _ => {}
        }
    }
    state.negotiation.purge_expired();
}

pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep(&state);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthService;
    use crate::bus::LocalBus;
    use crate::config::Config;
    use crate::gateway::endpoint::EndpointStatus;
    use crate::gateway::envelope::{ns, Envelope};
    use crate::gateway::handshake::handle_handshake;
    use crate::gateway::transport::TransportKind;
    use serde_json::json;

    fn state() -> AppState {
        let config = Config {
            grace_period: Duration::from_secs(60),
            long_poll_hold: Duration::from_secs(50),
            poll_reconnect_window: Duration::from_secs(10),
            ..Config::default()
        };
        let auth = StaticAuthService::from_list("ses_a:usr_a:ctx_1");
        AppState::new(config, Arc::new(auth), Arc::new(LocalBus::new()))
    }

    async fn promoted(state: &AppState, kind: TransportKind) -> (Arc<Connection>, Arc<Endpoint>) {
        let (conn, _rx) = Connection::new(kind, Some("ses_a".into()));
        conn.mark_open();
        state.connections.insert(conn.clone());
        let env = Envelope::new(ns::HANDSHAKE, json!({ "resource": "Browser" }));
        let accepted = handle_handshake(state, &conn, env).await.unwrap();
        conn.outbox().clear();
        (conn, accepted.endpoint)
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_degrades_then_expires_after_grace() {
        let state = state();
        let (conn, endpoint) = promoted(&state, TransportKind::WebSocket).await;

        connection_lost(&state, &conn, CloseReason::Lost);
        assert_eq!(endpoint.status(), EndpointStatus::Degraded);
        endpoint.enqueue(Envelope::new("chat", json!({})));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(state.directory.lookup("ses_a").len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(state.directory.lookup("ses_a").is_empty());
        assert!(endpoint.is_closed());
        assert!(endpoint.outbox().is_empty());
        assert_eq!(state.diagnostics.snapshot().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_expiry() {
        let state = state();
        let (conn, endpoint) = promoted(&state, TransportKind::WebSocket).await;
        connection_lost(&state, &conn, CloseReason::Lost);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let (second, resumed) = promoted(&state, TransportKind::LongPoll).await;
        assert_eq!(resumed.id, endpoint.id);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(endpoint.status(), EndpointStatus::Open);
        assert!(endpoint.is_current(&second));
        assert_eq!(state.directory.lookup("ses_a").len(), 1);
    }

    #[tokio::test]
    async fn superseded_connection_loss_leaves_endpoint_open() {
        let state = state();
        let (first, endpoint) = promoted(&state, TransportKind::WebSocket).await;
        let (_second, _) = promoted(&state, TransportKind::WebSocket).await;

        connection_lost(&state, &first, CloseReason::Lost);
        assert_eq!(endpoint.status(), EndpointStatus::Open);
    }

    #[tokio::test]
    async fn explicit_close_unregisters_immediately() {
        let state = state();
        let (conn, endpoint) = promoted(&state, TransportKind::WebSocket).await;
        endpoint.enqueue(Envelope::new("chat", json!({})));

        close_endpoint(&state, &endpoint, CloseReason::Normal);
        assert!(state.directory.lookup("ses_a").is_empty());
        assert!(conn.is_closed());
        assert!(endpoint.outbox().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_degrades_idle_pull_connection_and_activity_recovers_it() {
        let state = state();
        let (conn, endpoint) = promoted(&state, TransportKind::LongPoll).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        sweep(&state);
        assert_eq!(conn.state(), ConnectionState::Open);

        tokio::time::sleep(Duration::from_secs(31)).await;
        sweep(&state);
        assert_eq!(conn.state(), ConnectionState::Degraded);
        assert_eq!(endpoint.status(), EndpointStatus::Degraded);
        assert!(endpoint.grace().is_armed());

        connection_active(&conn);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(endpoint.status(), EndpointStatus::Open);
        assert!(!endpoint.grace().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_connection_with_poll_in_flight() {
        let state = state();
        let (conn, _endpoint) = promoted(&state, TransportKind::LongPoll).await;
        let _slot = conn.begin_poll(2).unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        sweep(&state);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_closed_connections_after_linger() {
        let state = state();
        let (conn, _endpoint) = promoted(&state, TransportKind::WebSocket).await;
        connection_lost(&state, &conn, CloseReason::Normal);

        sweep(&state);
        assert!(state.connections.get(&conn.id).is_some());
        tokio::time::sleep(CLOSED_LINGER + Duration::from_secs(1)).await;
        sweep(&state);
        assert!(state.connections.get(&conn.id).is_none());
    }
}
