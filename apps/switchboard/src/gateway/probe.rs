//! Negotiation probe: which transport kinds are usable for a client, in
//! preference order, plus a per-client cache of the answer.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::AppState;

use super::connection::Connection;
use super::error::GatewayError;
use super::transport::{TransportAdapter, TransportKind};

/// One attempt to establish a transport kind.
#[async_trait]
pub trait TransportProber: Send + Sync {
    async fn attempt(&self, kind: TransportKind) -> Result<(), GatewayError>;
}

pub struct NegotiationProbe {
    attempt_timeout: Duration,
}

impl NegotiationProbe {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }

    /// Try every candidate, most preferred first, and return the ones that
    /// succeeded in that order. Each attempt is bounded; nothing is retried.
    pub async fn probe(
        &self,
        prober: &dyn TransportProber,
        candidates: &[TransportKind],
    ) -> Vec<TransportKind> {
        let mut ordered = candidates.to_vec();
        ordered.sort_by_key(|k| k.preference_rank());
        ordered.dedup();

        let mut usable = Vec::with_capacity(ordered.len());
        for kind in ordered {
            match tokio::time::timeout(self.attempt_timeout, prober.attempt(kind)).await {
                Ok(Ok(())) => usable.push(kind),
                Ok(Err(e)) => tracing::debug!(transport = %kind, code = e.code(), "probe failed: {e}"),
                Err(_) => tracing::debug!(transport = %kind, "probe timed out"),
            }
        }
        usable
    }

    /// [`Self::probe`], failing with `NoUsableTransport` when nothing works.
    pub async fn negotiate(
        &self,
        prober: &dyn TransportProber,
        candidates: &[TransportKind],
    ) -> Result<Vec<TransportKind>, GatewayError> {
        let usable = self.probe(prober, candidates).await;
        if usable.is_empty() {
            return Err(GatewayError::NoUsableTransport);
        }
        Ok(usable)
    }
}

/// Boolean flag per known transport kind.
pub fn capability_flags(usable: &[TransportKind]) -> BTreeMap<String, bool> {
    TransportKind::PREFERENCE
        .iter()
        .map(|kind| (kind.to_string(), usable.contains(kind)))
        .collect()
}

/// Ordered list of usable kinds for the capability header.
pub fn capability_header(usable: &[TransportKind]) -> String {
    usable
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Server-side prober: a kind is usable when this gateway has it enabled,
/// the client declared support for it, and there is room for a connection.
pub struct ServerCapabilities<'a> {
    state: &'a AppState,
    client_supports: Option<HashSet<TransportKind>>,
}

impl<'a> ServerCapabilities<'a> {
    /// `client_supports` of `None` means the client did not restrict kinds.
    pub fn new(state: &'a AppState, client_supports: Option<Vec<TransportKind>>) -> Self {
        Self {
            state,
            client_supports: client_supports.map(|v| v.into_iter().collect()),
        }
    }
}

#[async_trait]
impl TransportProber for ServerCapabilities<'_> {
    async fn attempt(&self, kind: TransportKind) -> Result<(), GatewayError> {
        TransportAdapter::for_kind(kind, &self.state.config)?;
        if let Some(supported) = &self.client_supports {
            if !supported.contains(&kind) {
                return Err(GatewayError::NegotiationFailed(kind));
            }
        }
        if self.state.connections.len() >= self.state.config.max_connections {
            return Err(GatewayError::NegotiationFailed(kind));
        }
        Ok(())
    }
}

/// Probe results per client id. Entries live for the configured TTL; a
/// reconnecting client may be probed again.
pub struct NegotiationCache {
    entries: DashMap<String, (Vec<TransportKind>, Instant)>,
    ttl: Duration,
}

impl NegotiationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Vec<TransportKind>> {
        let entry = self.entries.get(client_id)?;
        let (kinds, at) = entry.value();
        (at.elapsed() < self.ttl).then(|| kinds.clone())
    }

    pub fn insert(&self, client_id: &str, usable: Vec<TransportKind>) {
        self.entries
            .insert(client_id.to_string(), (usable, Instant::now()));
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Open a connection with the first kind in `order` whose adapter accepts,
/// falling back past refusals. Any other error is returned as is.
pub fn open_with_fallback(
    state: &AppState,
    order: &[TransportKind],
    session_hint: Option<String>,
) -> Result<Arc<Connection>, GatewayError> {
    for &kind in order {
        let attempt = TransportAdapter::for_kind(kind, &state.config)
            .and_then(|adapter| adapter.open(state, session_hint.clone()));
        match attempt {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_fallback() => {
                tracing::debug!(transport = %kind, code = e.code(), "falling back: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    state.diagnostics.record(&GatewayError::NoUsableTransport);
    Err(GatewayError::NoUsableTransport)
}
