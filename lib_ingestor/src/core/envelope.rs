//! # Message Envelopes and Batches
//!
//! A `MessageEnvelope` wraps one ingested upstream message with the metadata the
//! pipeline needs to keep its ordering and delivery guarantees: a sequence number,
//! the receipt timestamp, the instant it entered the delivery buffer and how many
//! delivery attempts have carried it so far.
//!
//! Payloads are kept as the raw bytes received from the upstream (already validated
//! as JSON by the connector), so forwarding a batch never re-encodes a message.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// # Message Envelope
///
/// One ingested message. The sequence, payload and receipt time never change after
/// construction; only the buffer-owned bookkeeping (enqueue instant and attempt
/// count) is updated while the envelope waits for delivery.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    sequence: u64,
    payload: Bytes,
    received_at: DateTime<Utc>,
    enqueued_at: Instant,
    attempts: u32,
}

impl MessageEnvelope {
    /// Wraps `payload` with the given sequence number, stamped with the current time.
    pub fn new(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
            received_at: Utc::now(),
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }

    /// Sequence number, unique and strictly increasing per connector.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Wall-clock time the frame was received.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Instant the envelope was admitted into the delivery buffer.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Number of delivery attempts that have included this envelope.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Payload size in bytes, the unit used for batch byte limits.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Decodes the payload as a JSON value.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub(crate) fn mark_enqueued(&mut self, at: Instant) {
        self.enqueued_at = at;
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// # Batch
///
/// An ordered, non-empty run of envelopes delivered together in one attempt.
#[derive(Debug, Clone)]
pub struct Batch {
    envelopes: Vec<MessageEnvelope>,
    total_bytes: usize,
}

impl Batch {
    /// Builds a batch, returning `None` for an empty list.
    pub fn from_envelopes(envelopes: Vec<MessageEnvelope>) -> Option<Self> {
        if envelopes.is_empty() {
            return None;
        }
        let total_bytes = envelopes.iter().map(MessageEnvelope::size_bytes).sum();
        Some(Self { envelopes, total_bytes })
    }

    /// Number of envelopes in the batch.
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Always `false`; batches are never empty.
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Sequence of the first envelope.
    pub fn first_sequence(&self) -> u64 {
        self.envelopes.first().map_or(0, MessageEnvelope::sequence)
    }

    /// Sequence of the last envelope; acknowledging it confirms the whole batch.
    pub fn last_sequence(&self) -> u64 {
        self.envelopes.last().map_or(0, MessageEnvelope::sequence)
    }

    /// Sum of payload bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// The envelopes, in sequence order.
    pub fn envelopes(&self) -> &[MessageEnvelope] {
        &self.envelopes
    }

    /// Serializes the batch as a JSON array of payloads, preserving order.
    pub fn to_json_body(&self) -> Vec<u8> {
        let separators = self.envelopes.len().saturating_sub(1);
        let mut body = Vec::with_capacity(self.total_bytes + separators + 2);
        body.push(b'[');
        for (i, envelope) in self.envelopes.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(envelope.payload());
        }
        body.push(b']');
        body
    }
}

/// # Sequence Generator
///
/// Issues strictly increasing sequence numbers starting at 1. It is owned by the
/// coordinator and handed to every connector incarnation, so numbering survives
/// reconnects and unit restarts.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// A generator whose first value is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// A generator whose first value is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The most recently issued number, or 0 if none was issued yet.
    pub fn last_issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed).saturating_sub(1)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
