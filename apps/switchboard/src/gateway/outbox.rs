//! Bounded, priority-aware outbound queue.
//!
//! Higher priority is delivered first; equal priorities keep FIFO order. On
//! overflow the oldest message of the lowest priority present is evicted,
//! which may be the incoming message itself when it ranks below everything
//! already queued.
//!
//! Control traffic (acks, errors, pongs) rides a lane above every application
//! priority. It never counts against the capacity and never evicts queued
//! messages; it has its own, separate limit.
//!
//! Messages handed to a transport that cannot confirm delivery are kept in an
//! unacknowledged window until the client acknowledges them, so a failover can
//! put them back.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::envelope::Envelope;

/// Priority given to envelopes without one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Priority of the control lane. Application traffic is clamped below it.
pub const CONTROL_PRIORITY: i32 = i32::MAX;

/// Highest priority an application message can have.
pub const MAX_APP_PRIORITY: i32 = CONTROL_PRIORITY - 1;

/// Control messages held at once.
pub const CONTROL_LIMIT: usize = 64;

/// A queued envelope with its delivery sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub seq: u64,
    pub priority: i32,
    pub envelope: Envelope,
}

impl Outbound {
    pub fn is_control(&self) -> bool {
        self.priority == CONTROL_PRIORITY
    }
}

/// Result of [`Outbox::push`].
#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; this message was dropped to make room (or was the
    /// incoming message itself).
    Evicted(Outbound),
}

#[derive(Default)]
struct Levels {
    levels: BTreeMap<i32, VecDeque<Outbound>>,
    len: usize,
    control: usize,
    next_seq: u64,
    /// Handed out but not yet acknowledged, in hand-out order.
    unacked: VecDeque<Outbound>,
}

impl Levels {
    fn stamp(&mut self, mut envelope: Envelope, priority: i32) -> Outbound {
        self.next_seq += 1;
        envelope.seq = Some(self.next_seq);
        Outbound {
            seq: self.next_seq,
            priority,
            envelope,
        }
    }

    fn insert_back(&mut self, item: Outbound) {
        self.count(&item);
        self.levels.entry(item.priority).or_default().push_back(item);
    }

    fn insert_front(&mut self, item: Outbound) {
        self.count(&item);
        self.levels.entry(item.priority).or_default().push_front(item);
    }

    fn count(&mut self, item: &Outbound) {
        self.len += 1;
        if item.is_control() {
            self.control += 1;
        }
    }

    fn application_len(&self) -> usize {
        self.len - self.control
    }

    fn pop_highest(&mut self) -> Option<Outbound> {
        let key = *self.levels.keys().next_back()?;
        self.take_front(key)
    }

    fn pop_lowest(&mut self) -> Option<Outbound> {
        let key = *self.levels.keys().next()?;
        self.take_front(key)
    }

    fn take_front(&mut self, key: i32) -> Option<Outbound> {
        let level = self.levels.get_mut(&key)?;
        let item = level.pop_front();
        if level.is_empty() {
            self.levels.remove(&key);
        }
        if let Some(item) = &item {
            self.len -= 1;
            if item.is_control() {
                self.control -= 1;
            }
        }
        item
    }
}

pub struct Outbox {
    inner: Mutex<Levels>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Levels::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Everything queued, control lane included.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Application messages queued.
    pub fn pending(&self) -> usize {
        self.inner.lock().application_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an application envelope at its own priority, clamped below the
    /// control lane.
    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        let priority = envelope
            .priority
            .unwrap_or(DEFAULT_PRIORITY)
            .min(MAX_APP_PRIORITY);
        let evicted = {
            let mut inner = self.inner.lock();
            let item = inner.stamp(envelope, priority);

            let mut evicted = None;
            if inner.application_len() >= self.capacity {
                // Application messages are queued, so the lowest level is one
                // of theirs.
                let lowest = inner.levels.keys().next().copied().unwrap_or(priority);
                if priority < lowest {
                    return PushOutcome::Evicted(item);
                }
                evicted = inner.pop_lowest();
            }
            inner.insert_back(item);
            evicted
        };

        self.notify.notify_one();
        match evicted {
            Some(old) => PushOutcome::Evicted(old),
            None => PushOutcome::Queued,
        }
    }

    /// Queue a control envelope ahead of all application traffic. Past
    /// [`CONTROL_LIMIT`] the incoming message is the one dropped.
    pub fn push_control(&self, envelope: Envelope) -> PushOutcome {
        {
            let mut inner = self.inner.lock();
            let item = inner.stamp(envelope, CONTROL_PRIORITY);
            if inner.control >= CONTROL_LIMIT {
                return PushOutcome::Evicted(item);
            }
            inner.insert_back(item);
        }
        self.notify.notify_one();
        PushOutcome::Queued
    }

    /// Put a message that could not be written back at the head of its level.
    /// Requeueing ignores the capacity bound so nothing already accepted is
    /// lost, and it withdraws the message from the unacknowledged window.
    pub fn requeue(&self, item: Outbound) {
        {
            let mut inner = self.inner.lock();
            inner.unacked.retain(|u| u.seq != item.seq);
            inner.insert_front(item);
        }
        self.notify.notify_one();
    }

    /// Take the next message to deliver.
    pub fn pop(&self) -> Option<Outbound> {
        self.inner.lock().pop_highest()
    }

    /// Take the next message and keep a copy until it is acknowledged.
    pub fn pop_tracked(&self) -> Option<Outbound> {
        let mut inner = self.inner.lock();
        let item = inner.pop_highest()?;
        self.track(&mut inner, &item);
        Some(item)
    }

    /// Take up to `max` messages in delivery order.
    pub fn drain(&self, max: usize) -> Vec<Outbound> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::new();
        while batch.len() < max {
            match inner.pop_highest() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// [`Self::drain`], keeping copies until they are acknowledged.
    pub fn drain_tracked(&self, max: usize) -> Vec<Outbound> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::new();
        while batch.len() < max {
            match inner.pop_highest() {
                Some(item) => {
                    self.track(&mut inner, &item);
                    batch.push(item);
                }
                None => break,
            }
        }
        batch
    }

    /// The window holds at most `capacity` messages; older ones count as
    /// delivered.
    fn track(&self, inner: &mut Levels, item: &Outbound) {
        if inner.unacked.len() >= self.capacity {
            inner.unacked.pop_front();
        }
        inner.unacked.push_back(item.clone());
    }

    /// Messages handed out and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    /// Acknowledge exactly these sequence numbers.
    pub fn acknowledge(&self, seqs: &[u64]) {
        if seqs.is_empty() {
            return;
        }
        self.inner.lock().unacked.retain(|u| !seqs.contains(&u.seq));
    }

    /// Acknowledge `seq` and everything handed out before it. An unknown
    /// sequence acknowledges nothing.
    pub fn acknowledge_through(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.unacked.iter().position(|u| u.seq == seq) {
            inner.unacked.drain(..=pos);
        }
    }

    /// Put unacknowledged application messages back at the head of the queue
    /// in their original order, after acknowledging through `last_received`.
    /// Control messages in the window are dropped. Returns how many came back.
    pub fn restore_unacked(&self, last_received: Option<u64>) -> usize {
        if let Some(seq) = last_received {
            self.acknowledge_through(seq);
        }
        let restored = {
            let mut inner = self.inner.lock();
            let window: Vec<Outbound> = inner.unacked.drain(..).collect();
            let mut restored = 0;
            for item in window.into_iter().rev().filter(|i| !i.is_control()) {
                inner.insert_front(item);
                restored += 1;
            }
            restored
        };
        if restored > 0 {
            self.notify.notify_one();
        }
        restored
    }

    /// Drop queued control messages. Returns how many were dropped.
    pub fn discard_control(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner
            .levels
            .remove(&CONTROL_PRIORITY)
            .map_or(0, |level| level.len());
        inner.len -= dropped;
        inner.control = 0;
        dropped
    }

    /// Discard everything queued or awaiting acknowledgement. Returns how many
    /// queued messages were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.len;
        inner.levels.clear();
        inner.unacked.clear();
        inner.len = 0;
        inner.control = 0;
        dropped
    }

    /// Wait for the next message. Returns `None` when woken by [`Self::wake`]
    /// without anything queued, so drainers can re-check what they drain.
    pub async fn recv(&self) -> Option<Outbound> {
        if let Some(item) = self.pop() {
            return Some(item);
        }
        self.notify.notified().await;
        self.pop()
    }

    /// [`Self::recv`] through [`Self::pop_tracked`].
    pub async fn recv_tracked(&self) -> Option<Outbound> {
        if let Some(item) = self.pop_tracked() {
            return Some(item);
        }
        self.notify.notified().await;
        self.pop_tracked()
    }

    /// Resolve once something was pushed or [`Self::wake`] was called.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Wake every waiter without queueing anything. A waiter that registers
    /// afterwards still sees one spurious wake-up.
    pub fn wake(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
