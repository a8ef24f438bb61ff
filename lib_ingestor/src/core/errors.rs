//! # Pipeline Error Taxonomy
//!
//! Per-message and per-batch errors are handled where they occur (retried, logged
//! and counted). Only `FatalPipelineError` crosses the coordinator boundary and
//! reaches the process.

use std::fmt;

use thiserror::Error;

/// Handshake or authentication failure while establishing the upstream session.
/// Retried by the connector according to the backoff policy.
#[derive(Debug, Clone, Error)]
#[error("upstream connect failed: {reason}")]
pub struct ConnectError {
    /// Human readable cause.
    pub reason: String,
}

impl ConnectError {
    /// Creates an error from anything displayable.
    pub fn new(reason: impl fmt::Display) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// A malformed inbound frame. The frame is dropped with a warning; the session is
/// only torn down after too many consecutive protocol errors.
#[derive(Debug, Clone, Error)]
#[error("protocol error: {reason}")]
pub struct ProtocolError {
    /// Human readable cause.
    pub reason: String,
}

impl ProtocolError {
    /// Creates an error from anything displayable.
    pub fn new(reason: impl fmt::Display) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network error, timeout, 5xx or a retryable 4xx. Retried with backoff.
    #[error("transient delivery failure{}: {reason}", status_suffix(.status))]
    Transient {
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Human readable cause.
        reason: String,
    },
    /// A non-retryable rejection (e.g. 4xx validation). Escalated per policy.
    #[error("permanent delivery failure{}: {reason}", status_suffix(.status))]
    Permanent {
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Human readable cause.
        reason: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl DeliveryError {
    /// Transient failure without an HTTP status.
    pub fn transient(reason: impl fmt::Display) -> Self {
        Self::Transient {
            status: None,
            reason: reason.to_string(),
        }
    }

    /// Permanent failure without an HTTP status.
    pub fn permanent(reason: impl fmt::Display) -> Self {
        Self::Permanent {
            status: None,
            reason: reason.to_string(),
        }
    }

    /// Classifies a non-2xx HTTP status. 408, 425, 429 and 5xx are retryable;
    /// every other status is permanent.
    pub fn from_status(status: u16, reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        if matches!(status, 408 | 425 | 429) || (500..600).contains(&status) {
            Self::Transient {
                status: Some(status),
                reason,
            }
        } else {
            Self::Permanent {
                status: Some(status),
                reason,
            }
        }
    }

    /// Whether the failure may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::Permanent { status, .. } => *status,
        }
    }
}

/// Errors raised by the delivery buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The buffer is full and the overflow policy is `reject`.
    #[error("delivery buffer full (capacity {capacity}), envelope {sequence} rejected")]
    Overflow {
        /// Configured capacity.
        capacity: usize,
        /// Sequence of the rejected envelope.
        sequence: u64,
    },
    /// The buffer no longer admits envelopes (pipeline draining).
    #[error("delivery buffer is closed")]
    Closed,
    /// The envelope would break sequence order.
    #[error("envelope {sequence} is not after the last admitted sequence {last}")]
    OutOfOrder {
        /// Sequence of the refused envelope.
        sequence: u64,
        /// Last admitted sequence.
        last: u64,
    },
}

/// The supervised units of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// The upstream websocket connector.
    Connector,
    /// The batch forwarder.
    Forwarder,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connector => f.write_str("connector"),
            Self::Forwarder => f.write_str("forwarder"),
        }
    }
}

/// Terminal failures that halt the pipeline and surface to the caller.
#[derive(Debug, Clone, Error)]
pub enum FatalPipelineError {
    /// The connector exhausted its connect attempts.
    #[error("upstream unreachable after {attempts} connect attempts: {last}")]
    ConnectRetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The last connect error.
        last: ConnectError,
    },
    /// A batch could not be delivered and the fatal policy is `halt`.
    #[error("batch {first_sequence}..={last_sequence} undeliverable after {attempts} attempts: {last}")]
    DeliveryFailed {
        /// First sequence of the failed batch.
        first_sequence: u64,
        /// Last sequence of the failed batch.
        last_sequence: u64,
        /// Attempts made.
        attempts: u32,
        /// The last delivery error.
        last: DeliveryError,
    },
    /// A unit crashed more often than allowed.
    #[error("{unit} crashed {restarts} times, giving up")]
    RestartsExhausted {
        /// The unit that kept failing.
        unit: UnitKind,
        /// Restarts already performed.
        restarts: u32,
    },
    /// The supervising task itself failed.
    #[error("pipeline supervisor failed: {0}")]
    Supervisor(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(DeliveryError::from_status(500, "boom").is_transient());
        assert!(DeliveryError::from_status(503, "busy").is_transient());
        assert!(DeliveryError::from_status(429, "slow down").is_transient());
        assert!(DeliveryError::from_status(408, "timeout").is_transient());
        assert!(!DeliveryError::from_status(400, "bad").is_transient());
        assert!(!DeliveryError::from_status(404, "missing").is_transient());
        assert!(!DeliveryError::from_status(301, "moved").is_transient());
        assert_eq!(DeliveryError::from_status(422, "x").status(), Some(422));
    }

    #[test]
    fn messages_include_status() {
        let err = DeliveryError::from_status(502, "bad gateway");
        assert_eq!(err.to_string(), "transient delivery failure (HTTP 502): bad gateway");
        let err = DeliveryError::transient("connection reset");
        assert_eq!(err.to_string(), "transient delivery failure: connection reset");
    }
}
