//! # Batch Sink
//!
//! The seam through which batches leave the process. Production wires in
//! `retrieve::http_sink::HttpBatchSink`; tests inject in-memory sinks, so the
//! forwarder can be exercised without a network.

use std::future::Future;

use crate::core::envelope::Batch;
use crate::core::errors::DeliveryError;

/// Delivers one batch per call.
///
/// Implementations must report a `DeliveryError::Transient` for anything worth
/// retrying and `DeliveryError::Permanent` for rejections that will never succeed.
/// A returned `Ok(())` is taken as confirmation that every envelope in the batch
/// was consumed downstream.
pub trait BatchSink: Send + Sync + 'static {
    /// Attempts delivery of `batch`.
    fn deliver(&self, batch: &Batch) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}
