//! # lib_ingestor
//!
//! A long-lived ingestion-and-relay pipeline: an upstream websocket feed is
//! buffered, batched and forwarded to a downstream HTTP sink with at-least-once,
//! in-order delivery.
//!
//! Each top-level folder is gated behind a cargo feature of the same name (all
//! enabled by default through `full`):
//!
//! - **`core`**: envelopes, the bounded delivery buffer, backoff, health and errors.
//! - **`configs`**: layered settings and the validated `IngestorConfig`.
//! - **`loggers`**: fern based console/file logging.
//! - **`retrieve`**: the HTTP client and the downstream batch sink.
//! - **`ingestors`**: the upstream websocket connector.
//! - **`pipeline`**: the batch forwarder and the supervising coordinator.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "pipeline")]
pub mod pipeline;
#[cfg(feature = "retrieve")]
pub mod retrieve;
