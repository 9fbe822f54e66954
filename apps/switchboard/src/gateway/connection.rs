//! The uniform connection every transport adapter produces.
//!
//! A connection owns an inbound queue (frames from the client, consumed by its
//! worker), a control outbox used until the handshake completes, and a
//! liveness signal. Once promoted, outbound traffic is read from the
//! endpoint's outbox instead, so a failover never strands queued messages on
//! a dead connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use utoipa::ToSchema;

use switchboard_common::id::{prefix, PrefixedId};

use super::endpoint::Endpoint;
use super::envelope::Envelope;
use super::error::GatewayError;
use super::outbox::{Outbound, Outbox, PushOutcome};
use super::transport::TransportKind;

/// Frames buffered between a transport and the connection worker.
const INBOUND_CAPACITY: usize = 64;

/// Control messages buffered before the handshake completes.
const CONTROL_CAPACITY: usize = 32;

/// Pull batches remembered per connection for duplicated request ids.
const REPLAY_HISTORY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Open,
    Degraded,
    Closed,
}

/// Why a connection was closed. Sockets carry the code in their close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit `close` message or transport-level close.
    Normal,
    /// The transport failed or the client stopped polling.
    Lost,
    HandshakeInvalid,
    HandshakeTimeout,
    /// A newer connection resumed the same endpoint.
    Superseded,
    /// The endpoint's grace period ran out.
    Expired,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::Lost => 1001,
            CloseReason::HandshakeInvalid => 4004,
            CloseReason::HandshakeTimeout => 4009,
            CloseReason::Superseded => 4010,
            CloseReason::Expired => 4011,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::Lost => "lost",
            CloseReason::HandshakeInvalid => "handshake invalid",
            CloseReason::HandshakeTimeout => "handshake timeout",
            CloseReason::Superseded => "superseded",
            CloseReason::Expired => "expired",
        }
    }
}

/// A pull request id, while it is being served and after.
enum PullRequest {
    InFlight {
        request_id: String,
        done: watch::Receiver<Option<Vec<Envelope>>>,
    },
    Served {
        request_id: String,
        messages: Vec<Envelope>,
    },
}

impl PullRequest {
    fn request_id(&self) -> &str {
        match self {
            PullRequest::InFlight { request_id, .. } | PullRequest::Served { request_id, .. } => {
                request_id
            }
        }
    }
}

/// What a pull request should do after claiming its request id.
pub enum PullTicket {
    /// The id was already served, or a duplicate finished meanwhile: answer
    /// with the same batch.
    Replay(Vec<Envelope>),
    /// Serve a new batch and hand it to the slot.
    Fresh(BatchSlot),
}

pub struct Connection {
    pub id: String,
    pub kind: TransportKind,
    pub created_at: Instant,
    /// Session identifier supplied out-of-band by the transport request.
    pub session_hint: Option<String>,
    last_activity: Mutex<Instant>,
    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    inbound: mpsc::Sender<String>,
    control: Arc<Outbox>,
    endpoint: RwLock<Option<Weak<Endpoint>>>,
    outstanding: AtomicUsize,
    requests: Mutex<VecDeque<PullRequest>>,
    /// Sequence numbers served by completed pull requests and not yet
    /// acknowledged by a later one.
    served: Mutex<Vec<u64>>,
    /// Last message the client received on a previous connection.
    resume_point: Mutex<Option<u64>>,
}

impl PrefixedId for Connection {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl Connection {
    /// Create a CONNECTING connection and the receiving half of its inbound queue.
    pub fn new(kind: TransportKind, session_hint: Option<String>) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: Self::generate_id(),
            kind,
            created_at: now,
            session_hint,
            last_activity: Mutex::new(now),
            state,
            close_reason: Mutex::new(None),
            inbound,
            control: Arc::new(Outbox::new(CONTROL_CAPACITY)),
            endpoint: RwLock::new(None),
            outstanding: AtomicUsize::new(0),
            requests: Mutex::new(VecDeque::new()),
            served: Mutex::new(Vec::new()),
            resume_point: Mutex::new(None),
        });
        (conn, rx)
    }

    // -- liveness -----------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Liveness signal for adapters that need to react to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// CONNECTING → OPEN.
    pub fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Open)
    }

    /// OPEN → DEGRADED.
    pub fn degrade(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Degraded)
    }

    /// DEGRADED → OPEN.
    pub fn recover(&self) -> bool {
        self.transition(ConnectionState::Degraded, ConnectionState::Open)
    }

    /// Move to CLOSED. Returns `false` if already closed; the first reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        let closed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
            true
        });
        if closed {
            *self.close_reason.lock() = Some(reason);
            self.touch();
        }
        closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolve once the connection is CLOSED. Cancels nothing by itself;
    /// every suspended receive or send selects on it.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    // -- endpoint binding ---------------------------------------------------

    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_promoted(&self) -> bool {
        self.endpoint.read().is_some()
    }

    /// Bind this connection to `endpoint` with `ack` as the first message it
    /// reads from there. Control messages queued before the handshake move
    /// ahead of the ack; a waiting writer is woken only once both are queued,
    /// so it switches queues and finds the ack before any flushed message.
    pub fn promote(&self, endpoint: &Arc<Endpoint>, ack: Envelope) -> Result<(), GatewayError> {
        let outbox = endpoint.outbox();
        let mut overflow = false;
        for item in self.control.drain(usize::MAX) {
            overflow |= matches!(outbox.push_control(item.envelope), PushOutcome::Evicted(_));
        }
        overflow |= matches!(outbox.push_control(ack), PushOutcome::Evicted(_));
        *self.endpoint.write() = Some(Arc::downgrade(endpoint));
        // Anything a concurrent sender left on the old queue during the switch.
        for item in self.control.drain(usize::MAX) {
            overflow |= matches!(outbox.push_control(item.envelope), PushOutcome::Evicted(_));
        }
        self.control.wake();

        if overflow {
            tracing::warn!(connection_id = %self.id, endpoint_id = %endpoint.id, "control queue full at promotion");
            return Err(GatewayError::QueueOverflow {
                endpoint_id: endpoint.id.clone(),
            });
        }
        Ok(())
    }

    /// The queue outbound traffic is read from right now.
    pub fn outbox(&self) -> Arc<Outbox> {
        match self.endpoint() {
            Some(endpoint) => endpoint.outbox().clone(),
            None => self.control.clone(),
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Hand a raw frame to the connection worker.
    pub async fn deliver(&self, frame: String) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }
        self.touch();
        self.inbound
            .send(frame)
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    // -- outbound -----------------------------------------------------------

    /// Queue a gateway control message ahead of application traffic. Fails
    /// with `QueueOverflow` when the control lane is full and the message was
    /// dropped.
    pub fn send_control(&self, envelope: Envelope) -> Result<(), GatewayError> {
        match self.outbox().push_control(envelope) {
            PushOutcome::Queued => Ok(()),
            PushOutcome::Evicted(dropped) => {
                tracing::warn!(
                    connection_id = %self.id,
                    ns = %dropped.envelope.ns,
                    "control queue full; dropped message"
                );
                Err(GatewayError::QueueOverflow {
                    endpoint_id: self
                        .endpoint()
                        .map(|e| e.id.clone())
                        .unwrap_or_else(|| self.id.clone()),
                })
            }
        }
    }

    /// Transports other than the socket cannot tell whether a message reached
    /// the client, so what they hand out stays unacknowledged on the endpoint.
    pub fn tracks_delivery(&self) -> bool {
        self.kind != TransportKind::WebSocket
    }

    /// Record the last sequence the client saw before reconnecting.
    pub fn set_resume_point(&self, seq: Option<u64>) {
        *self.resume_point.lock() = seq;
    }

    pub fn resume_point(&self) -> Option<u64> {
        *self.resume_point.lock()
    }

    /// Put back a message the transport failed to write.
    pub fn requeue(&self, item: Outbound) {
        self.outbox().requeue(item);
    }

    /// Next message for a push transport. Returns `None` once the connection
    /// is closed and its own control messages are flushed.
    pub async fn next_outbound(&self) -> Option<Outbound> {
        loop {
            if self.is_closed() {
                return self.control.pop();
            }
            let outbox = self.outbox();
            let next = async {
                if self.tracks_delivery() {
                    outbox.recv_tracked().await
                } else {
                    outbox.recv().await
                }
            };
            tokio::select! {
                biased;
                _ = self.closed() => {}
                item = next => {
                    if let Some(item) = item {
                        if self.is_closed() {
                            outbox.requeue(item);
                            continue;
                        }
                        return Some(item);
                    }
                }
            }
        }
    }

    /// Pull-side race: return as soon as something is queued, or an empty
    /// batch once `hold` elapses or the connection closes.
    pub async fn collect(&self, max: usize, hold: Duration) -> Vec<Outbound> {
        let deadline = tokio::time::Instant::now() + hold;
        loop {
            if self.is_closed() {
                return self.control.drain(max);
            }
            let outbox = self.outbox();
            let batch = if self.tracks_delivery() {
                outbox.drain_tracked(max)
            } else {
                outbox.drain(max)
            };
            if self.is_closed() {
                // Superseded while draining: the batch belongs to the next
                // connection.
                for item in batch.into_iter().rev() {
                    outbox.requeue(item);
                }
                continue;
            }
            if !batch.is_empty() || hold.is_zero() {
                return batch;
            }
            tokio::select! {
                _ = outbox.changed() => {}
                _ = self.closed() => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    // -- pull requests ------------------------------------------------------

    /// Claim one of `limit` pull-request slots for the lifetime of the guard.
    pub fn begin_poll(self: &Arc<Self>, limit: usize) -> Result<PollGuard, GatewayError> {
        let previous = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::PollLimit);
        }
        self.touch();
        Ok(PollGuard { conn: self.clone() })
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Claim a pull request id. A duplicate of a served id replays its batch;
    /// a duplicate of one still in flight waits for that batch instead of
    /// draining a second one. Requests without an id are always fresh.
    pub async fn claim_request(self: &Arc<Self>, request_id: Option<String>) -> PullTicket {
        let Some(request_id) = request_id else {
            return PullTicket::Fresh(BatchSlot {
                conn: self.clone(),
                request: None,
            });
        };
        loop {
            let mut done = {
                let mut requests = self.requests.lock();
                match requests.iter().find(|r| r.request_id() == request_id) {
                    Some(PullRequest::Served { messages, .. }) => {
                        return PullTicket::Replay(messages.clone());
                    }
                    Some(PullRequest::InFlight { done, .. }) => done.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        requests.push_back(PullRequest::InFlight {
                            request_id: request_id.clone(),
                            done: rx,
                        });
                        while requests.len() > REPLAY_HISTORY {
                            requests.pop_front();
                        }
                        return PullTicket::Fresh(BatchSlot {
                            conn: self.clone(),
                            request: Some((request_id, tx)),
                        });
                    }
                }
            };
            let finished = done
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|batch| (*batch).clone());
            if let Some(messages) = finished {
                return PullTicket::Replay(messages);
            }
            // The original request was abandoned; claim the id again.
        }
    }

    /// A new pull request shows the responses before it arrived: acknowledge
    /// what they carried.
    pub fn acknowledge_served(&self) {
        let seqs = std::mem::take(&mut *self.served.lock());
        if let Some(endpoint) = self.endpoint() {
            endpoint.outbox().acknowledge(&seqs);
        }
    }
}

/// A claimed pull request. Finishing it publishes the batch to duplicates of
/// the same id; dropping it unfinished releases the id.
pub struct BatchSlot {
    conn: Arc<Connection>,
    request: Option<(String, watch::Sender<Option<Vec<Envelope>>>)>,
}

impl BatchSlot {
    pub fn finish(mut self, batch: Vec<Outbound>) -> Vec<Envelope> {
        self.conn.served.lock().extend(batch.iter().map(|o| o.seq));
        let messages: Vec<Envelope> = batch.into_iter().map(|o| o.envelope).collect();

        if let Some((request_id, done)) = self.request.take() {
            {
                let mut requests = self.conn.requests.lock();
                let entry = requests.iter_mut().find(|r| {
                    matches!(r, PullRequest::InFlight { request_id: id, .. } if *id == request_id)
                });
                if let Some(entry) = entry {
                    *entry = PullRequest::Served {
                        request_id,
                        messages: messages.clone(),
                    };
                }
            }
            done.send_replace(Some(messages.clone()));
        }
        messages
    }
}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        if let Some((request_id, _)) = self.request.take() {
            self.conn.requests.lock().retain(|r| {
                !matches!(r, PullRequest::InFlight { request_id: id, .. } if *id == request_id)
            });
        }
    }
}

/// Held slot of a pull request. Releasing it counts as activity.
pub struct PollGuard {
    conn: Arc<Connection>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.conn.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.conn.touch();
    }
}

/// All physical connections by id. Side-channel requests use it to find the
/// connection they pair with.
#[derive(Default)]
pub struct ConnectionTable {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id.clone(), conn);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    /// Like [`Self::get`], failing with `UnknownConnection`.
    pub fn require(&self, id: &str) -> Result<Arc<Connection>, GatewayError> {
        self.get(id)
            .ok_or_else(|| GatewayError::UnknownConnection(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Point-in-time copy of every connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }
}
