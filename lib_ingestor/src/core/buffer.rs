//! # Delivery Buffer
//!
//! The bounded, ordered queue shared by the upstream connector (single writer) and
//! the batch forwarder (single reader/acknowledger). It is the only state the two
//! units share, and every access goes through its own internal lock, so callers
//! never need external synchronization.
//!
//! ## Guarantees:
//!
//! - **Order**: envelopes are admitted only with a sequence greater than anything
//!   admitted or acknowledged before, and are always visible in that order.
//! - **At-least-once**: reading (`peek_batch`) never removes anything. Envelopes
//!   leave the buffer only through `acknowledge` (or a drop-oldest eviction), so a
//!   forwarder that dies mid-delivery simply replays from the front.
//! - **Bounded**: at capacity the configured `OverflowPolicy` applies. `Block`
//!   suspends the producer until an acknowledgement frees space, `DropOldest`
//!   evicts the head, and `Reject` refuses the new envelope.
//!
//! Waiting is event driven: producers blocked on space wake on `acknowledge`, and
//! the forwarder wakes on every admission through `changed()`.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::envelope::{Batch, MessageEnvelope};
use crate::core::errors::BufferError;

/// Behaviour of `push` when the buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Suspend the producer until space frees up.
    Block,
    /// Evict the oldest pending envelope to make room.
    DropOldest,
    /// Refuse the new envelope with `BufferError::Overflow`.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "block" => Ok(Self::Block),
            "drop-oldest" => Ok(Self::DropOldest),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown overflow policy '{other}' (expected block, drop-oldest or reject)"
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::DropOldest => f.write_str("drop-oldest"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

/// Result of a successful `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The envelope was admitted without side effects.
    Accepted,
    /// The envelope was admitted after evicting the oldest pending envelope.
    Evicted {
        /// Sequence of the evicted envelope.
        sequence: u64,
    },
}

/// Point-in-time counters of a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Pending envelopes.
    pub len: usize,
    /// Pending payload bytes.
    pub bytes: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Highest sequence ever admitted.
    pub last_admitted: u64,
    /// Highest sequence acknowledged so far.
    pub acknowledged_up_to: u64,
    /// Envelopes removed by acknowledgement.
    pub acknowledged: u64,
    /// Envelopes evicted under `DropOldest`.
    pub dropped: u64,
    /// Envelopes refused under `Reject`.
    pub rejected: u64,
    /// Whether admission has been closed for draining.
    pub closed: bool,
}

/// A cheap view used by the forwarder to decide when to flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushView {
    /// Pending envelopes.
    pub len: usize,
    /// Pending payload bytes.
    pub bytes: usize,
    /// Enqueue instant of the oldest pending envelope.
    pub oldest_enqueued_at: Option<Instant>,
    /// Whether admission is closed.
    pub closed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<MessageEnvelope>,
    bytes: usize,
    last_admitted: u64,
    acked_up_to: u64,
    acknowledged: u64,
    dropped: u64,
    rejected: u64,
    closed: bool,
}

enum Admission {
    Admitted(PushOutcome),
    Full(MessageEnvelope),
}

/// # Delivery Buffer
///
/// Thread- and task-safe bounded store of pending envelopes.
#[derive(Debug)]
pub struct DeliveryBuffer {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
    space_freed: Notify,
    changed: Notify,
}

impl DeliveryBuffer {
    /// Creates an empty buffer. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            inner: Mutex::new(Inner::default()),
            space_freed: Notify::new(),
            changed: Notify::new(),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Push
    ///
    /// Appends `envelope` at the tail. At capacity the overflow policy decides:
    /// `Block` waits (cancel by dropping the future), `DropOldest` evicts the head,
    /// `Reject` fails with `BufferError::Overflow`.
    pub async fn push(&self, envelope: MessageEnvelope) -> Result<PushOutcome, BufferError> {
        let mut pending = envelope;
        loop {
            let space_freed = self.space_freed.notified();
            tokio::pin!(space_freed);
            space_freed.as_mut().enable();

            match self.admit(pending)? {
                Admission::Admitted(outcome) => return Ok(outcome),
                Admission::Full(envelope) => pending = envelope,
            }

            log::trace!("Delivery buffer full ({}), producer waiting for space", self.capacity);
            space_freed.await;
        }
    }

    /// Non-suspending variant of `push`. Under `Block` a full buffer yields
    /// `BufferError::Overflow` instead of waiting.
    pub fn try_push(&self, envelope: MessageEnvelope) -> Result<PushOutcome, BufferError> {
        match self.admit(envelope)? {
            Admission::Admitted(outcome) => Ok(outcome),
            Admission::Full(envelope) => Err(BufferError::Overflow {
                capacity: self.capacity,
                sequence: envelope.sequence(),
            }),
        }
    }

    fn admit(&self, mut envelope: MessageEnvelope) -> Result<Admission, BufferError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(BufferError::Closed);
        }

        let floor = inner.last_admitted.max(inner.acked_up_to);
        if envelope.sequence() <= floor {
            return Err(BufferError::OutOfOrder {
                sequence: envelope.sequence(),
                last: floor,
            });
        }

        let mut outcome = PushOutcome::Accepted;
        if inner.queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => return Ok(Admission::Full(envelope)),
                OverflowPolicy::Reject => {
                    inner.rejected += 1;
                    log::warn!(
                        "Delivery buffer full ({} envelopes), rejecting envelope {}",
                        self.capacity,
                        envelope.sequence()
                    );
                    return Err(BufferError::Overflow {
                        capacity: self.capacity,
                        sequence: envelope.sequence(),
                    });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = inner.queue.pop_front() {
                        inner.bytes -= evicted.size_bytes();
                        inner.dropped += 1;
                        log::warn!(
                            "Delivery buffer full ({} envelopes), dropped oldest envelope {}",
                            self.capacity,
                            evicted.sequence()
                        );
                        outcome = PushOutcome::Evicted {
                            sequence: evicted.sequence(),
                        };
                    }
                }
            }
        }

        envelope.mark_enqueued(Instant::now());
        inner.bytes += envelope.size_bytes();
        inner.last_admitted = envelope.sequence();
        inner.queue.push_back(envelope);
        drop(inner);

        self.changed.notify_waiters();
        Ok(Admission::Admitted(outcome))
    }

    /// # Peek Batch
    ///
    /// Returns up to `max_count` pending envelopes from the head without removing
    /// them, stopping before `max_bytes` would be exceeded. A single envelope larger
    /// than `max_bytes` is still returned on its own so it cannot wedge the queue.
    pub fn peek_batch(&self, max_count: usize, max_bytes: usize) -> Option<Batch> {
        let inner = self.lock();
        let max_count = max_count.max(1);

        let mut taken = Vec::with_capacity(max_count.min(inner.queue.len()));
        let mut bytes = 0usize;
        for envelope in &inner.queue {
            if taken.len() >= max_count {
                break;
            }
            if !taken.is_empty() && bytes + envelope.size_bytes() > max_bytes {
                break;
            }
            bytes += envelope.size_bytes();
            taken.push(envelope.clone());
        }

        Batch::from_envelopes(taken)
    }

    /// Records a delivery attempt on every pending envelope with a sequence up to
    /// and including `up_to`.
    pub fn mark_attempted(&self, up_to: u64) {
        let mut inner = self.lock();
        for envelope in inner.queue.iter_mut().take_while(|e| e.sequence() <= up_to) {
            envelope.record_attempt();
        }
    }

    /// # Acknowledge
    ///
    /// Removes every envelope with a sequence `<= up_to` and returns how many were
    /// removed. Idempotent and monotonic: acknowledging again, or acknowledging a
    /// lower sequence, is a no-op.
    pub fn acknowledge(&self, up_to: u64) -> usize {
        let mut inner = self.lock();
        let mut removed = 0usize;
        while inner.queue.front().is_some_and(|e| e.sequence() <= up_to) {
            if let Some(envelope) = inner.queue.pop_front() {
                inner.bytes -= envelope.size_bytes();
                removed += 1;
            }
        }
        inner.acknowledged += removed as u64;
        inner.acked_up_to = inner.acked_up_to.max(up_to);
        drop(inner);

        if removed > 0 {
            self.space_freed.notify_waiters();
            self.changed.notify_waiters();
        }
        removed
    }

    /// Stops admitting envelopes. Pending envelopes stay readable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.space_freed.notify_waiters();
        self.changed.notify_waiters();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pending envelope count.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Sequences of the pending envelopes, head first.
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.lock().queue.iter().map(MessageEnvelope::sequence).collect()
    }

    /// Current counters.
    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            len: inner.queue.len(),
            bytes: inner.bytes,
            capacity: self.capacity,
            last_admitted: inner.last_admitted,
            acknowledged_up_to: inner.acked_up_to,
            acknowledged: inner.acknowledged,
            dropped: inner.dropped,
            rejected: inner.rejected,
            closed: inner.closed,
        }
    }

    /// The numbers the forwarder needs to decide whether to flush.
    pub fn flush_view(&self) -> FlushView {
        let inner = self.lock();
        FlushView {
            len: inner.queue.len(),
            bytes: inner.bytes,
            oldest_enqueued_at: inner.queue.front().map(MessageEnvelope::enqueued_at),
            closed: inner.closed,
        }
    }

    /// A future that resolves on the next admission, acknowledgement or close.
    /// Call `enable()` on it (pinned) before inspecting state to avoid missed wakeups.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }
}
