//! Namespace/recipient routing between endpoints and the backend bus.

use std::str::FromStr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::bus::{MessageBus, NamespaceFilter};

use super::diagnostics::Diagnostics;
use super::directory::SessionDirectory;
use super::endpoint::Endpoint;
use super::envelope::{Envelope, Recipient};
use super::error::GatewayError;
use super::outbox::PushOutcome;

/// What happens to a message whose recipient has no live endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoRoutePolicy {
    /// Discard and report `NoRoute`.
    #[default]
    Drop,
    /// Hand to the bus's offline path.
    Queue,
}

impl FromStr for NoRoutePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(NoRoutePolicy::Drop),
            "queue" => Ok(NoRoutePolicy::Queue),
            other => Err(format!("unknown no-route policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Control namespace; handled by the connection worker, never forwarded.
    Local,
    /// Enqueued on this many endpoints.
    Delivered { endpoints: usize },
    /// Handed to the backend bus.
    Forwarded,
    /// No live endpoint; handed to the bus's offline path.
    Queued,
}

pub struct MessageRouter {
    directory: Arc<SessionDirectory>,
    bus: Arc<dyn MessageBus>,
    diagnostics: Arc<Diagnostics>,
    no_route: NoRoutePolicy,
}

impl MessageRouter {
    pub fn new(
        directory: Arc<SessionDirectory>,
        bus: Arc<dyn MessageBus>,
        diagnostics: Arc<Diagnostics>,
        no_route: NoRoutePolicy,
    ) -> Self {
        Self {
            directory,
            bus,
            diagnostics,
            no_route,
        }
    }

    /// Route a message sent by a client endpoint. It is tagged with the
    /// sender's address; without a recipient it goes to the backend.
    /// Failures are recorded in diagnostics before they are returned.
    pub async fn route_from(
        &self,
        origin: &Endpoint,
        envelope: Envelope,
    ) -> Result<RouteOutcome, GatewayError> {
        let result = self.try_route_from(origin, envelope).await;
        self.observe(result)
    }

    /// Route a message emitted by a backend producer. Without a recipient it
    /// answers the envelope's own session.
    pub async fn route_backend(&self, envelope: Envelope) -> Result<RouteOutcome, GatewayError> {
        let result = self.try_route_backend(envelope).await;
        self.observe(result)
    }

    fn observe(&self, result: Result<RouteOutcome, GatewayError>) -> Result<RouteOutcome, GatewayError> {
        if let Err(err) = &result {
            self.diagnostics.record(err);
        }
        result
    }

    async fn try_route_from(
        &self,
        origin: &Endpoint,
        mut envelope: Envelope,
    ) -> Result<RouteOutcome, GatewayError> {
        envelope.validate()?;
        if envelope.is_control() {
            return Ok(RouteOutcome::Local);
        }
        if let Some(session) = envelope.session.as_deref() {
            if session != origin.session_id {
                return Err(GatewayError::Malformed(format!(
                    "session '{session}' does not match the handshake"
                )));
            }
        }
        envelope.session = Some(origin.session_id.clone());
        envelope.from = Some(origin.address());
        envelope.seq = None;

        match envelope.recipient()? {
            None => {
                self.bus
                    .publish(envelope)
                    .await
                    .map_err(|e| GatewayError::BackendUnavailable(e.to_string()))?;
                Ok(RouteOutcome::Forwarded)
            }
            Some(recipient) => self.fan_out(recipient, envelope).await,
        }
    }

    async fn try_route_backend(&self, mut envelope: Envelope) -> Result<RouteOutcome, GatewayError> {
        envelope.validate()?;
        if envelope.is_control() {
            tracing::debug!(ns = %envelope.ns, "ignoring backend control message");
            return Ok(RouteOutcome::Local);
        }
        envelope.seq = None;

        let recipient = match envelope.recipient()? {
            Some(recipient) => recipient,
            None => match envelope.session.as_deref().and_then(Recipient::parse) {
                Some(recipient) => recipient,
                None => {
                    return Err(GatewayError::Malformed(
                        "backend message needs `to` or `session`".into(),
                    ))
                }
            },
        };
        self.fan_out(recipient, envelope).await
    }

    /// Enqueue on every matching endpoint. Never blocks on a slow endpoint;
    /// overflow only evicts from that endpoint's own queue.
    async fn fan_out(
        &self,
        recipient: Recipient,
        envelope: Envelope,
    ) -> Result<RouteOutcome, GatewayError> {
        let targets: Vec<Arc<Endpoint>> = match &recipient {
            Recipient::Broadcast => self.directory.all(),
            Recipient::Session(session) => self.directory.lookup(session),
            Recipient::Endpoint { session, resource } => self
                .directory
                .lookup_exact(session, resource)
                .into_iter()
                .collect(),
        }
        .into_iter()
        .filter(|endpoint| !endpoint.is_closed())
        .collect();

        if targets.is_empty() {
            return self.no_route(recipient, envelope).await;
        }

        for endpoint in &targets {
            if let PushOutcome::Evicted(evicted) = endpoint.enqueue(envelope.clone()) {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    evicted_seq = evicted.seq,
                    evicted_priority = evicted.priority,
                    "outbound queue full; evicted message"
                );
                self.diagnostics.record(&GatewayError::QueueOverflow {
                    endpoint_id: endpoint.id.clone(),
                });
            }
        }
        tracing::debug!(
            ns = %envelope.ns,
            to = %recipient,
            endpoints = targets.len(),
            "message routed"
        );
        Ok(RouteOutcome::Delivered {
            endpoints: targets.len(),
        })
    }

    async fn no_route(
        &self,
        recipient: Recipient,
        envelope: Envelope,
    ) -> Result<RouteOutcome, GatewayError> {
        match self.no_route {
            NoRoutePolicy::Drop => Err(GatewayError::NoRoute {
                recipient: recipient.to_string(),
            }),
            NoRoutePolicy::Queue => {
                self.bus
                    .publish_undeliverable(envelope)
                    .await
                    .map_err(|e| GatewayError::BackendUnavailable(e.to_string()))?;
                tracing::debug!(to = %recipient, "no live endpoint; queued on backend");
                Ok(RouteOutcome::Queued)
            }
        }
    }
}

/// Subscribe to the bus and route every backend-emitted envelope until the
/// subscription ends.
pub fn spawn_backend_pump(
    router: Arc<MessageRouter>,
    bus: Arc<dyn MessageBus>,
    filter: NamespaceFilter,
) -> JoinHandle<()> {
    let mut messages = bus.subscribe(filter);
    tokio::spawn(async move {
        while let Some(envelope) = messages.next().await {
            if let Err(e) = router.route_backend(envelope).await {
                tracing::debug!(code = e.code(), "backend message not delivered: {e}");
            }
        }
        tracing::info!("backend subscription ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionInfo;
    use crate::bus::LocalBus;
    use serde_json::json;

    struct Fixture {
        directory: Arc<SessionDirectory>,
        bus: LocalBus,
        diagnostics: Arc<Diagnostics>,
        router: MessageRouter,
    }

    fn fixture(policy: NoRoutePolicy) -> Fixture {
        let directory = Arc::new(SessionDirectory::new());
        let bus = LocalBus::new();
        let diagnostics = Arc::new(Diagnostics::new());
        let router = MessageRouter::new(
            directory.clone(),
            Arc::new(bus.clone()),
            diagnostics.clone(),
            policy,
        );
        Fixture {
            directory,
            bus,
            diagnostics,
            router,
        }
    }

    fn register(dir: &SessionDirectory, session: &str, resource: &str, cap: usize) -> Arc<Endpoint> {
        let info = SessionInfo {
            session_id: session.into(),
            user_id: format!("usr_{session}"),
            context_id: "ctx_1".into(),
        };
        dir.get_or_register(&info, resource, cap).0
    }

    fn texts(endpoint: &Endpoint) -> Vec<String> {
        endpoint
            .outbox()
            .drain(usize::MAX)
            .into_iter()
            .map(|o| o.envelope.data["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn session_recipient_fans_out_to_every_resource() {
        let f = fixture(NoRoutePolicy::Drop);
        let browser = register(&f.directory, "ses_a", "Browser", 8);
        let phone = register(&f.directory, "ses_a", "Phone", 8);
        let other = register(&f.directory, "ses_b", "Browser", 8);

        let outcome = f
            .router
            .route_backend(Envelope::new("chat", json!({ "text": "hi" })).to("ses_a"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered { endpoints: 2 });
        assert_eq!(texts(&browser), vec!["hi"]);
        assert_eq!(texts(&phone), vec!["hi"]);
        assert!(other.outbox().is_empty());
    }

    #[tokio::test]
    async fn endpoint_recipient_targets_one_resource() {
        let f = fixture(NoRoutePolicy::Drop);
        let browser = register(&f.directory, "ses_a", "Browser", 8);
        let phone = register(&f.directory, "ses_a", "Phone", 8);

        f.router
            .route_backend(Envelope::new("chat", json!({ "text": "x" })).to("ses_a/Phone"))
            .await
            .unwrap();
        assert!(browser.outbox().is_empty());
        assert_eq!(texts(&phone), vec!["x"]);
    }

    #[tokio::test]
    async fn client_message_without_recipient_goes_to_backend_tagged() {
        let f = fixture(NoRoutePolicy::Drop);
        let mut backend = f.bus.consume();
        let origin = register(&f.directory, "ses_a", "Browser", 8);
        let peer = register(&f.directory, "ses_a", "Phone", 8);

        let outcome = f
            .router
            .route_from(&origin, Envelope::new("chat", json!({ "text": "up" })))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded);

        let forwarded = backend.recv().await.unwrap();
        assert_eq!(forwarded.from.as_deref(), Some("ses_a/Browser"));
        assert_eq!(forwarded.session.as_deref(), Some("ses_a"));
        assert!(peer.outbox().is_empty());
    }

    #[tokio::test]
    async fn client_message_with_foreign_session_is_rejected() {
        let f = fixture(NoRoutePolicy::Drop);
        let origin = register(&f.directory, "ses_a", "Browser", 8);
        let mut env = Envelope::new("chat", json!({}));
        env.session = Some("ses_b".into());
        assert!(matches!(
            f.router.route_from(&origin, env).await,
            Err(GatewayError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn control_namespaces_stay_local() {
        let f = fixture(NoRoutePolicy::Drop);
        let mut backend = f.bus.consume();
        let origin = register(&f.directory, "ses_a", "Browser", 8);
        let outcome = f
            .router
            .route_from(&origin, Envelope::new("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Local);
        assert!(backend.try_recv().is_err());
    }

    #[tokio::test]
    async fn backend_reply_without_recipient_echoes_to_session() {
        let f = fixture(NoRoutePolicy::Drop);
        let browser = register(&f.directory, "ses_a", "Browser", 8);
        let mut env = Envelope::new("ack", json!({ "text": "done" }));
        env.session = Some("ses_a".into());
        f.router.route_backend(env).await.unwrap();
        assert_eq!(texts(&browser), vec!["done"]);
    }

    #[tokio::test]
    async fn unknown_session_is_no_route_under_drop_policy() {
        let f = fixture(NoRoutePolicy::Drop);
        let result = f
            .router
            .route_backend(Envelope::new("chat", json!({})).to("ses_nobody"))
            .await;
        assert!(matches!(result, Err(GatewayError::NoRoute { .. })));
        assert_eq!(f.diagnostics.snapshot().no_route, 1);
    }

    #[tokio::test]
    async fn unknown_session_is_queued_under_queue_policy() {
        let f = fixture(NoRoutePolicy::Queue);
        let mut offline = f.bus.consume_undeliverable();
        let outcome = f
            .router
            .route_backend(Envelope::new("chat", json!({})).to("ses_nobody"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Queued);
        assert_eq!(offline.recv().await.unwrap().to.as_deref(), Some("ses_nobody"));
    }

    #[tokio::test]
    async fn per_endpoint_order_is_preserved() {
        let f = fixture(NoRoutePolicy::Drop);
        let a = register(&f.directory, "ses_a", "Browser", 64);
        let b = register(&f.directory, "ses_b", "Browser", 64);
        for i in 0..20 {
            f.router
                .route_backend(Envelope::new("n", json!({ "text": i.to_string() })).to("ses_a"))
                .await
                .unwrap();
            f.router
                .route_backend(Envelope::new("n", json!({ "text": i.to_string() })).to("*"))
                .await
                .unwrap();
        }
        let expected_a: Vec<String> = (0..20).flat_map(|i| [i.to_string(), i.to_string()]).collect();
        assert_eq!(texts(&a), expected_a);
        let expected_b: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(texts(&b), expected_b);
    }

    #[tokio::test]
    async fn overflow_is_a_diagnostic_not_a_failure() {
        let f = fixture(NoRoutePolicy::Drop);
        let slow = register(&f.directory, "ses_a", "Browser", 2);
        let fast = register(&f.directory, "ses_a", "Phone", 16);
        for i in 0..5 {
            let outcome = f
                .router
                .route_backend(Envelope::new("n", json!({ "text": i.to_string() })).to("ses_a"))
                .await
                .unwrap();
            assert_eq!(outcome, RouteOutcome::Delivered { endpoints: 2 });
        }
        assert_eq!(texts(&slow), vec!["3", "4"]);
        assert_eq!(texts(&fast).len(), 5);
        assert_eq!(f.diagnostics.snapshot().queue_overflow, 3);
    }

    #[tokio::test]
    async fn backend_pump_routes_emitted_messages() {
        let f = fixture(NoRoutePolicy::Drop);
        let browser = register(&f.directory, "ses_a", "Browser", 8);
        let bus: Arc<dyn MessageBus> = Arc::new(f.bus.clone());
        let router = Arc::new(f.router);
        let pump = spawn_backend_pump(router, bus, NamespaceFilter::parse("chat"));

        f.bus.emit(Envelope::new("typing", json!({ "text": "skip" })).to("ses_a"));
        f.bus.emit(Envelope::new("chat", json!({ "text": "pumped" })).to("ses_a"));

        let item = tokio::time::timeout(std::time::Duration::from_secs(5), browser.outbox().recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.envelope.data["text"], "pumped");
        assert!(browser.outbox().is_empty());
        pump.abort();
    }
}
