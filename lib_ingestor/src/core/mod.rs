//! # Core Pipeline Primitives
//!
//! The building blocks shared by the upstream connector and the batch forwarder.
//! Nothing in here performs network I/O; the components are pure data structures
//! and policies, which keeps them easy to exercise in isolation.
//!
//! ## Core Components:
//!
//! - **`backoff`**: Exponential backoff with bounded, optionally seeded jitter.
//!   Used identically for reconnects, delivery retries and unit restarts.
//!
//! - **`envelope`**: `MessageEnvelope` (one ingested message plus metadata),
//!   `Batch` (an ordered group of envelopes) and the `SequenceGenerator` that
//!   stamps envelopes across reconnects.
//!
//! - **`buffer`**: The bounded, ordered `DeliveryBuffer` sitting between the
//!   connector (single writer) and the forwarder (single reader/acknowledger).
//!
//! - **`health`**: A `watch`-backed health signal describing the connection,
//!   forwarder progress and any terminal failure.
//!
//! - **`errors`**: The error taxonomy of the pipeline.
//!
//! - **`sink`**: The `BatchSink` trait, the seam through which batches leave the
//!   process.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Exponential backoff policy with jitter.
pub mod backoff;
/// The bounded, ordered delivery buffer.
pub mod buffer;
/// Message envelopes, batches and sequence numbering.
pub mod envelope;
/// Error taxonomy for the whole pipeline.
pub mod errors;
/// Pipeline health signal.
pub mod health;
/// The outbound delivery seam.
pub mod sink;

// --- Public API Re-exports ---
pub use backoff::BackoffPolicy;
pub use buffer::{BufferStats, DeliveryBuffer, OverflowPolicy, PushOutcome};
pub use envelope::{Batch, MessageEnvelope, SequenceGenerator};
pub use errors::{
    BufferError, ConnectError, DeliveryError, FatalPipelineError, ProtocolError, UnitKind,
};
pub use health::{ConnectionState, ForwarderState, HealthSnapshot, HealthStatus, PipelineHealth};
pub use sink::BatchSink;
