//! # Pipeline
//!
//! The moving parts that join the connector to the sink.
//!
//! ## Contained Modules:
//!
//! - **`forwarder`**: `BatchForwarder` drains the `DeliveryBuffer` into size and
//!   time bounded batches, delivers them through a `BatchSink` with retry and
//!   acknowledges them once confirmed.
//! - **`coordinator`**: `PipelineCoordinator` wires connector, buffer and
//!   forwarder together, supervises both units (crash restarts with backoff),
//!   performs the graceful drain on shutdown and surfaces terminal failures.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Supervision and lifecycle of a whole pipeline.
pub mod coordinator;
/// Batch delivery with retry.
pub mod forwarder;

// --- Public API Re-exports ---
pub use coordinator::{PipelineCoordinator, PipelineHandle, PipelineProbe, PipelineReport};
pub use forwarder::{BatchForwarder, ForwarderExit, RetryState};
