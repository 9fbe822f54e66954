//! In-process message bus.
//!
//! Two `tokio::sync::broadcast` channels: upstream carries client traffic to
//! backend consumers in this process, downstream carries backend-emitted
//! envelopes to the gateway. Slow receivers skip messages
//! (`RecvError::Lagged`) instead of stalling the senders.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::gateway::envelope::Envelope;

use super::{BusError, MessageBus, NamespaceFilter};

const CHANNEL_CAPACITY: usize = 4096;

/// Cloneable; every clone shares the same channels.
#[derive(Clone)]
pub struct LocalBus {
    upstream: broadcast::Sender<Envelope>,
    offline: broadcast::Sender<Envelope>,
    downstream: broadcast::Sender<Envelope>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (upstream, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (offline, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (downstream, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            upstream,
            offline,
            downstream,
        }
    }

    /// Receiver for client-originated envelopes (the backend side).
    pub fn consume(&self) -> broadcast::Receiver<Envelope> {
        self.upstream.subscribe()
    }

    /// Receiver for envelopes that had no live recipient.
    pub fn consume_undeliverable(&self) -> broadcast::Receiver<Envelope> {
        self.offline.subscribe()
    }

    /// Emit an envelope from the backend towards clients.
    pub fn emit(&self, envelope: Envelope) {
        // No subscriber means the gateway is not pumping yet; nothing to do.
        let _ = self.downstream.send(envelope);
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        if self.upstream.send(envelope).is_err() {
            tracing::debug!("no backend consumer subscribed; envelope dropped");
        }
        Ok(())
    }

    async fn publish_undeliverable(&self, envelope: Envelope) -> Result<(), BusError> {
        let _ = self.offline.send(envelope);
        Ok(())
    }

    fn subscribe(&self, filter: NamespaceFilter) -> BoxStream<'static, Envelope> {
        let rx = self.downstream.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "backend subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |envelope| std::future::ready(filter.matches(&envelope.ns)))
        .boxed()
    }
}
