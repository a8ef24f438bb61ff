//! # Data Retrieval Module
//!
//! Outbound HTTP for the pipeline: a generic `ApiClient` built on `reqwest` and
//! `reqwest-middleware`, and the `HttpBatchSink` that delivers batches to the
//! downstream endpoint.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: the client wrapper. Retries through `reqwest-retry` are opt-in
//!   per client; the token bootstrap uses them, the sink does not, because the
//!   batch forwarder owns delivery retries and must count every attempt itself.
//! - **`http_sink`**: maps a `Batch` onto one HTTP request and classifies the
//!   outcome as success, transient or permanent failure.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with optional retry middleware.
pub mod ky_http;
/// Downstream HTTP batch delivery.
pub mod http_sink;

// --- Public API Re-exports ---
pub use http_sink::HttpBatchSink;
pub use ky_http::{ApiClient, ApiResponse, RawResponse};
