//! # Pipeline Health
//!
//! A `tokio::sync::watch` channel carrying the latest `HealthSnapshot`. The
//! connector publishes its connection state, the forwarder its progress, and the
//! coordinator any terminal failure. An external supervisor (the admin REST
//! surface, a service manager) reads or subscribes to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle of the upstream session. Owned and published by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    Disconnected,
    /// Resolving the endpoint and performing the websocket handshake.
    Connecting,
    /// Exchanging credentials / subscriptions over the fresh session.
    Authenticating,
    /// Receive loop active, heartbeat armed.
    Connected,
    /// Stop requested, finishing in-flight work before disconnecting.
    Draining,
    /// The last attempt or session failed; a reconnect is pending.
    Failed,
}

/// Progress of the batch forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ForwarderState {
    /// Waiting for the next batch.
    Idle,
    /// A delivery attempt is in flight.
    Delivering,
    /// The current batch failed transiently and waits for its next attempt.
    Retrying {
        /// Attempts made so far for the current batch.
        attempt: u32,
    },
    /// Flushing the remaining buffer during shutdown.
    Draining,
    /// Delivery stopped after a fatal failure.
    Halted,
    /// The forwarder exited.
    Stopped,
}

/// Coarse health derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Connected upstream and delivering downstream.
    Healthy,
    /// Working on it: reconnecting or retrying a batch.
    Degraded,
    /// Failed fatally or stopped.
    Unhealthy,
}

/// Everything the health signal knows at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Current upstream connection state.
    pub connection: ConnectionState,
    /// Current forwarder state.
    pub forwarder: ForwarderState,
    /// Batches confirmed by the sink.
    pub delivered_batches: u64,
    /// Envelopes confirmed by the sink.
    pub delivered_messages: u64,
    /// Batches given up on under the `drop` fatal policy.
    pub dropped_batches: u64,
    /// Upstream sessions established (first connect included).
    pub sessions: u64,
    /// Time of the last confirmed delivery.
    pub last_delivery: Option<DateTime<Utc>>,
    /// Terminal failure, if any.
    pub fatal: Option<String>,
    /// Set once the pipeline has shut down.
    pub stopped: bool,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            forwarder: ForwarderState::Idle,
            delivered_batches: 0,
            delivered_messages: 0,
            dropped_batches: 0,
            sessions: 0,
            last_delivery: None,
            fatal: None,
            stopped: false,
        }
    }
}

impl HealthSnapshot {
    /// Derives the coarse status.
    pub fn status(&self) -> HealthStatus {
        if self.fatal.is_some() || self.stopped || self.forwarder == ForwarderState::Halted {
            return HealthStatus::Unhealthy;
        }
        match (self.connection, self.forwarder) {
            (
                ConnectionState::Connected,
                ForwarderState::Idle | ForwarderState::Delivering | ForwarderState::Draining,
            ) => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }
}

/// Publishing side of the health signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PipelineHealth {
    tx: Arc<watch::Sender<HealthSnapshot>>,
}

impl PipelineHealth {
    /// A fresh signal in the `Disconnected`/`Idle` state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HealthSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Subscribes to changes.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.tx.subscribe()
    }

    /// A copy of the current snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.tx.borrow().clone()
    }

    /// The current coarse status.
    pub fn status(&self) -> HealthStatus {
        self.tx.borrow().status()
    }

    /// Publishes a connection state change.
    pub fn set_connection(&self, state: ConnectionState) {
        self.tx.send_if_modified(|s| {
            let changed = s.connection != state;
            if state == ConnectionState::Connected && changed {
                s.sessions += 1;
            }
            s.connection = state;
            changed
        });
    }

    /// Publishes a forwarder state change.
    pub fn set_forwarder(&self, state: ForwarderState) {
        self.tx.send_if_modified(|s| {
            let changed = s.forwarder != state;
            s.forwarder = state;
            changed
        });
    }

    /// Records a confirmed batch of `messages` envelopes.
    pub fn record_delivery(&self, messages: usize) {
        self.tx.send_modify(|s| {
            s.delivered_batches += 1;
            s.delivered_messages += messages as u64;
            s.last_delivery = Some(Utc::now());
        });
    }

    /// Records a batch dropped under the `drop` fatal policy.
    pub fn record_dropped_batch(&self) {
        self.tx.send_modify(|s| s.dropped_batches += 1);
    }

    /// Records a terminal failure. The first failure wins.
    pub fn set_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|s| {
            if s.fatal.is_none() {
                s.fatal = Some(reason);
            }
        });
    }

    /// Marks the pipeline as shut down.
    pub fn mark_stopped(&self) {
        self.tx.send_modify(|s| {
            s.stopped = true;
            s.connection = ConnectionState::Disconnected;
            if s.forwarder != ForwarderState::Halted {
                s.forwarder = ForwarderState::Stopped;
            }
        });
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}
