//! Hand-off to and from the backend message producers and consumers.

pub mod local;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::gateway::envelope::Envelope;

pub use local::LocalBus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("message bus closed")]
    Closed,
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
}

/// Abstraction over the backend message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Forward a client-originated envelope to backend consumers.
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Offline path for envelopes whose recipient has no live endpoint.
    /// Buses without one drop the envelope.
    async fn publish_undeliverable(&self, envelope: Envelope) -> Result<(), BusError> {
        tracing::debug!(ns = %envelope.ns, "bus has no offline path; dropping");
        Ok(())
    }

    /// Backend-emitted envelopes whose namespace matches `filter`.
    fn subscribe(&self, filter: NamespaceFilter) -> BoxStream<'static, Envelope>;
}

/// Namespace predicate for [`MessageBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceFilter {
    All,
    /// Exact names, or prefixes when the entry ends with `*`.
    Only(Vec<String>),
}

impl NamespaceFilter {
    /// `*` or a comma-separated list such as `chat,presence.*`.
    pub fn parse(value: &str) -> Self {
        let entries: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if entries.is_empty() || entries.iter().any(|e| e == "*") {
            NamespaceFilter::All
        } else {
            NamespaceFilter::Only(entries)
        }
    }

    pub fn matches(&self, namespace: &str) -> bool {
        match self {
            NamespaceFilter::All => true,
            NamespaceFilter::Only(entries) => entries.iter().any(|entry| match entry.strip_suffix('*') {
                Some(prefix) => namespace.starts_with(prefix),
                None => namespace == entry,
            }),
        }
    }
}
