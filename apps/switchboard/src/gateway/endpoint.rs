//! Authenticated (session, resource) endpoints.
//!
//! An endpoint's identity is fixed at handshake time; the physical connection
//! behind it is a replaceable field so a transport failover keeps the same
//! endpoint, outbound queue and sequence.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use switchboard_common::id::{prefix, PrefixedId};

use crate::auth::SessionInfo;

use super::connection::Connection;
use super::envelope::{endpoint_address, Envelope};
use super::outbox::{Outbox, PushOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointStatus {
    /// Backed by a live connection.
    Open,
    /// Connection lost; messages queue until a reconnect or the grace period ends.
    Degraded,
    /// Removed from the directory; never reopens.
    Closed,
}

struct Link {
    status: EndpointStatus,
    connection: Option<Arc<Connection>>,
    degraded_at: Option<Instant>,
}

pub struct Endpoint {
    pub id: String,
    pub session_id: String,
    pub resource: String,
    pub user_id: String,
    pub context_id: String,
    pub connected_at: DateTime<Utc>,
    outbox: Arc<Outbox>,
    link: Mutex<Link>,
    grace: GraceTimer,
}

impl PrefixedId for Endpoint {
    const PREFIX: &'static str = prefix::ENDPOINT;
}

impl Endpoint {
    pub fn new(session: &SessionInfo, resource: &str, queue_capacity: usize) -> Self {
        Self {
            id: Self::generate_id(),
            session_id: session.session_id.clone(),
            resource: resource.to_string(),
            user_id: session.user_id.clone(),
            context_id: session.context_id.clone(),
            connected_at: Utc::now(),
            outbox: Arc::new(Outbox::new(queue_capacity)),
            link: Mutex::new(Link {
                status: EndpointStatus::Open,
                connection: None,
                degraded_at: None,
            }),
            grace: GraceTimer::default(),
        }
    }

    /// `session/resource`.
    pub fn address(&self) -> String {
        endpoint_address(&self.session_id, &self.resource)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Queue a message for delivery. Never blocks.
    pub fn enqueue(&self, envelope: Envelope) -> PushOutcome {
        self.outbox.push(envelope)
    }

    pub fn status(&self) -> EndpointStatus {
        self.link.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == EndpointStatus::Closed
    }

    /// How long the endpoint has been DEGRADED, if it is.
    pub fn degraded_for(&self) -> Option<Duration> {
        self.link.lock().degraded_at.map(|at| at.elapsed())
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.link.lock().connection.clone()
    }

    /// Whether `conn` is the connection currently carrying this endpoint.
    pub fn is_current(&self, conn: &Connection) -> bool {
        self.link
            .lock()
            .connection
            .as_ref()
            .is_some_and(|c| c.id == conn.id)
    }

    /// Swap in a new connection and mark the endpoint OPEN. Returns the
    /// connection it replaced, or `Err(())` when the endpoint already closed.
    pub fn attach(&self, conn: Arc<Connection>) -> Result<Option<Arc<Connection>>, ()> {
        let previous = {
            let mut link = self.link.lock();
            if link.status == EndpointStatus::Closed {
                return Err(());
            }
            link.status = EndpointStatus::Open;
            link.degraded_at = None;
            link.connection.replace(conn)
        };
        self.grace.cancel();
        Ok(previous.filter(|p| !self.is_current(p)))
    }

    /// OPEN → DEGRADED. Returns `true` on transition.
    pub fn mark_degraded(&self) -> bool {
        let mut link = self.link.lock();
        if link.status != EndpointStatus::Open {
            return false;
        }
        link.status = EndpointStatus::Degraded;
        link.degraded_at = Some(Instant::now());
        true
    }

    /// DEGRADED → OPEN on the same connection. Returns `true` on transition.
    pub fn mark_open(&self) -> bool {
        let recovered = {
            let mut link = self.link.lock();
            if link.status != EndpointStatus::Degraded {
                return false;
            }
            link.status = EndpointStatus::Open;
            link.degraded_at = None;
            true
        };
        self.grace.cancel();
        recovered
    }

    /// Final transition. Returns the connection that was attached, if the
    /// endpoint was not already closed.
    pub fn mark_closed(&self) -> Option<Option<Arc<Connection>>> {
        let mut link = self.link.lock();
        if link.status == EndpointStatus::Closed {
            return None;
        }
        link.status = EndpointStatus::Closed;
        link.degraded_at = None;
        Some(link.connection.take())
    }

    /// Close only if still DEGRADED (grace expiry must not race a reconnect).
    pub fn close_if_degraded(&self) -> Option<Option<Arc<Connection>>> {
        let mut link = self.link.lock();
        if link.status != EndpointStatus::Degraded {
            return None;
        }
        link.status = EndpointStatus::Closed;
        link.degraded_at = None;
        Some(link.connection.take())
    }

    pub fn grace(&self) -> &GraceTimer {
        &self.grace
    }
}

/// Cancellable, restartable timeout. Arming again replaces the pending timer.
#[derive(Default)]
pub struct GraceTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GraceTimer {
    pub fn arm<F>(&self, period: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            on_expire.await;
        });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the pending timer. Returns `true` if one was running.
    pub fn cancel(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    /// Forget the timer without aborting it (called from its own expiry).
    pub fn disarm(&self) {
        self.handle.lock().take();
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for GraceTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::transport::TransportKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn session() -> SessionInfo {
        SessionInfo {
            session_id: "ses_1".into(),
            user_id: "usr_1".into(),
            context_id: "ctx_1".into(),
        }
    }

    #[test]
    fn new_endpoint_is_open_with_address() {
        let ep = Endpoint::new(&session(), "Browser", 8);
        assert!(ep.id.starts_with("ep_"));
        assert_eq!(ep.address(), "ses_1/Browser");
        assert_eq!(ep.status(), EndpointStatus::Open);
        assert_eq!(ep.outbox().capacity(), 8);
    }

    #[tokio::test]
    async fn attach_replaces_connection_and_reopens() {
        let ep = Endpoint::new(&session(), "Browser", 8);
        let (first, _rx1) = Connection::new(TransportKind::WebSocket, None);
        let (second, _rx2) = Connection::new(TransportKind::LongPoll, None);

        assert!(ep.attach(first.clone()).unwrap().is_none());
        assert!(ep.is_current(&first));

        assert!(ep.mark_degraded());
        assert!(ep.degraded_for().is_some());
        let replaced = ep.attach(second.clone()).unwrap().unwrap();
        assert_eq!(replaced.id, first.id);
        assert!(ep.is_current(&second));
        assert_eq!(ep.status(), EndpointStatus::Open);
    }

    #[tokio::test]
    async fn closed_endpoint_refuses_attach() {
        let ep = Endpoint::new(&session(), "Browser", 8);
        let (conn, _rx) = Connection::new(TransportKind::WebSocket, None);
        assert!(ep.mark_closed().is_some());
        assert!(ep.mark_closed().is_none());
        assert!(ep.attach(conn).is_err());
        assert!(!ep.mark_degraded());
    }

    #[test]
    fn close_if_degraded_ignores_open_endpoint() {
        let ep = Endpoint::new(&session(), "Browser", 8);
        assert!(ep.close_if_degraded().is_none());
        ep.mark_degraded();
        assert!(ep.close_if_degraded().is_some());
        assert!(ep.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_fires_after_period() {
        let timer = GraceTimer::default();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timer.arm(Duration::from_secs(60), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_grace_timer_never_fires() {
        let timer = GraceTimer::default();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timer.arm(Duration::from_secs(10), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(timer.cancel());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_restarts_the_window() {
        let timer = GraceTimer::default();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        timer.arm(Duration::from_secs(10), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(8)).await;

        let flag = fired.clone();
        timer.arm(Duration::from_secs(10), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
