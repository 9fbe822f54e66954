//! Transport kinds and the adapter that opens a uniform `Connection` for each.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::Config;
use crate::AppState;

use super::connection::Connection;
use super::outbox::Outbound;
use super::error::GatewayError;
use super::worker;

/// One concrete wire mechanism for carrying the logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Full-duplex persistent socket.
    WebSocket,
    /// Server-Sent Events; upstream over a paired side-channel.
    EventStream,
    /// Held request answered when data arrives or the hold time elapses.
    LongPoll,
    /// Chunked newline-delimited JSON response; upstream over a side-channel.
    Streaming,
    /// Repeated JSONP fetches.
    #[serde(rename = "script")]
    ScriptTag,
    /// Plain request/response polling.
    Polling,
}

impl TransportKind {
    /// Fallback order: persistent socket first, degraded kinds last.
    pub const PREFERENCE: [TransportKind; 6] = [
        TransportKind::WebSocket,
        TransportKind::EventStream,
        TransportKind::LongPoll,
        TransportKind::Streaming,
        TransportKind::ScriptTag,
        TransportKind::Polling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::EventStream => "eventstream",
            TransportKind::LongPoll => "longpoll",
            TransportKind::Streaming => "streaming",
            TransportKind::ScriptTag => "script",
            TransportKind::Polling => "polling",
        }
    }

    /// Position in [`Self::PREFERENCE`]; lower is preferred.
    pub fn preference_rank(self) -> usize {
        Self::PREFERENCE
            .iter()
            .position(|k| *k == self)
            .unwrap_or(Self::PREFERENCE.len())
    }

    /// Server pushes on a held response; the client never polls.
    pub fn is_push(self) -> bool {
        matches!(
            self,
            TransportKind::WebSocket | TransportKind::EventStream | TransportKind::Streaming
        )
    }

    /// Client-initiated fetches carry every downstream message.
    pub fn is_pull(self) -> bool {
        !self.is_push()
    }

    /// Upstream traffic travels on a separate request paired by connection id.
    pub fn needs_side_channel(self) -> bool {
        self != TransportKind::WebSocket
    }

    /// Parse a comma-separated list, skipping unknown names and duplicates.
    pub fn parse_list(value: &str) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name.parse::<TransportKind>() {
                Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Ok(_) => {}
                Err(_) => tracing::debug!(%name, "ignoring unknown transport kind"),
            }
        }
        kinds
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" | "socket" => Ok(TransportKind::WebSocket),
            "eventstream" | "sse" | "stream" => Ok(TransportKind::EventStream),
            "longpoll" | "long-poll" => Ok(TransportKind::LongPoll),
            "streaming" | "chunked" => Ok(TransportKind::Streaming),
            "script" | "scripttag" | "jsonp" => Ok(TransportKind::ScriptTag),
            "polling" | "poll" => Ok(TransportKind::Polling),
            other => Err(GatewayError::UnsupportedTransport(other.to_string())),
        }
    }
}

/// Per-kind adapter. Each variant terminates one wire protocol; all of them
/// produce the same [`Connection`] with its inbound queue, outbound queue and
/// liveness signal. Route handlers move frames through [`Self::receive`] and
/// [`Self::send`] so the per-kind behaviour stays here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAdapter {
    WebSocket,
    EventStream,
    Streaming,
    LongPoll {
        hold: std::time::Duration,
        max_outstanding: usize,
    },
    ScriptTag,
    Polling,
}

impl TransportAdapter {
    /// Select the adapter for `kind`, refusing kinds this gateway has disabled.
    pub fn for_kind(kind: TransportKind, config: &Config) -> Result<Self, GatewayError> {
        if !config.transport_enabled(kind) {
            return Err(GatewayError::UnsupportedTransport(kind.to_string()));
        }
        Ok(match kind {
            TransportKind::WebSocket => TransportAdapter::WebSocket,
            TransportKind::EventStream => TransportAdapter::EventStream,
            TransportKind::Streaming => TransportAdapter::Streaming,
            TransportKind::LongPoll => TransportAdapter::LongPoll {
                hold: config.long_poll_hold,
                max_outstanding: config.long_poll_max_outstanding.max(1),
            },
            TransportKind::ScriptTag => TransportAdapter::ScriptTag,
            TransportKind::Polling => TransportAdapter::Polling,
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportAdapter::WebSocket => TransportKind::WebSocket,
            TransportAdapter::EventStream => TransportKind::EventStream,
            TransportAdapter::Streaming => TransportKind::Streaming,
            TransportAdapter::LongPoll { .. } => TransportKind::LongPoll,
            TransportAdapter::ScriptTag => TransportKind::ScriptTag,
            TransportAdapter::Polling => TransportKind::Polling,
        }
    }

    /// How long a pull request may be held open. Only long-poll holds.
    pub fn hold_time(&self) -> Option<std::time::Duration> {
        match self {
            TransportAdapter::LongPoll { hold, .. } => Some(*hold),
            _ => None,
        }
    }

    /// Concurrent pull requests tolerated per connection.
    pub fn max_outstanding(&self) -> usize {
        match self {
            TransportAdapter::LongPoll { max_outstanding, .. } => *max_outstanding,
            // Script-tag and plain polling tolerate a duplicated request in flight.
            TransportAdapter::ScriptTag | TransportAdapter::Polling => 2,
            _ => 1,
        }
    }

    /// Client to gateway: hand one raw frame to the connection worker.
    pub async fn receive(&self, conn: &Connection, frame: String) -> Result<(), GatewayError> {
        if conn.kind != self.kind() {
            return Err(GatewayError::Malformed(format!(
                "{} connection cannot receive through the {} adapter",
                conn.kind,
                self.kind()
            )));
        }
        conn.deliver(frame).await
    }

    /// Gateway to client: the next delivery for this transport. Push kinds
    /// wait for one message and return `None` once the connection closes.
    /// Pull kinds return a batch of up to `max`, holding only as long as the
    /// hold time allows; the batch may be empty.
    pub async fn send(&self, conn: &Connection, max: usize) -> Option<Vec<Outbound>> {
        match self {
            TransportAdapter::WebSocket
            | TransportAdapter::EventStream
            | TransportAdapter::Streaming => conn.next_outbound().await.map(|item| vec![item]),
            TransportAdapter::LongPoll { hold, .. } => Some(conn.collect(max, *hold).await),
            TransportAdapter::ScriptTag | TransportAdapter::Polling => {
                Some(conn.collect(max, std::time::Duration::ZERO).await)
            }
        }
    }

    /// Create the connection for a transport-level open that succeeded:
    /// register it, start its inbound worker and mark it OPEN.
    pub fn open(
        &self,
        state: &AppState,
        session_hint: Option<String>,
    ) -> Result<Arc<Connection>, GatewayError> {
        if state.connections.len() >= state.config.max_connections {
            tracing::warn!(
                transport = %self.kind(),
                limit = state.config.max_connections,
                "connection limit reached"
            );
            state
                .diagnostics
                .record(&GatewayError::NegotiationFailed(self.kind()));
            return Err(GatewayError::NegotiationFailed(self.kind()));
        }

        let (conn, inbound) = Connection::new(self.kind(), session_hint);
        conn.mark_open();
        state.connections.insert(conn.clone());
        worker::spawn(state.clone(), conn.clone(), inbound);

        tracing::info!(
            connection_id = %conn.id,
            transport = %self.kind(),
            "connection opened"
        );
        Ok(conn)
    }
}
