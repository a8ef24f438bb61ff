//! # Pipeline Coordinator
//!
//! Owns one pipeline: a `DeliveryBuffer`, the `UpstreamConnector` writing into it
//! and the `BatchForwarder` draining it. Both units run as separate tasks under a
//! supervisor task.
//!
//! ## Supervision:
//!
//! - A unit that panics or exits unexpectedly is restarted after a backoff delay,
//!   reusing the same buffer and sequence generator, so nothing buffered is lost
//!   and numbering continues. After `max_unit_restarts` restarts of the same unit
//!   the pipeline fails.
//! - A fatal error from either unit (connect attempts exhausted, undeliverable
//!   batch under `halt`) stops the sibling, drains what can still be delivered and
//!   ends the pipeline with that error.
//!
//! ## Graceful shutdown:
//!
//! 1. Cancel the connector. No new inbound frames are accepted.
//! 2. Close the buffer and switch the forwarder into drain mode.
//! 3. Wait for the buffer to empty, at most `shutdown_timeout`, then cancel the
//!    forwarder. Whatever is still pending is reported as undelivered.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::configs::IngestorConfig;
use crate::core::backoff::BackoffPolicy;
use crate::core::buffer::{BufferStats, DeliveryBuffer};
use crate::core::envelope::SequenceGenerator;
use crate::core::errors::{FatalPipelineError, UnitKind};
use crate::core::health::{HealthSnapshot, HealthStatus, PipelineHealth};
use crate::core::sink::BatchSink;
use crate::ingestors::upstream_ws::{ConnectorControl, UpstreamConnector};
use crate::pipeline::forwarder::{BatchForwarder, ForwarderExit};

const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Summary of a pipeline that has stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    /// Batches confirmed by the sink.
    pub delivered_batches: u64,
    /// Envelopes confirmed by the sink.
    pub delivered_messages: u64,
    /// Batches given up on under the `drop` policy.
    pub dropped_batches: u64,
    /// Envelopes evicted by the `drop-oldest` overflow policy.
    pub evicted_messages: u64,
    /// Envelopes refused by the `reject` overflow policy.
    pub rejected_messages: u64,
    /// Envelopes still in the buffer when the pipeline stopped.
    pub undelivered_messages: usize,
    /// Upstream sessions established.
    pub sessions: u64,
}

impl PipelineReport {
    fn collect(health: &HealthSnapshot, buffer: &BufferStats) -> Self {
        Self {
            delivered_batches: health.delivered_batches,
            delivered_messages: health.delivered_messages,
            dropped_batches: health.dropped_batches,
            evicted_messages: buffer.dropped,
            rejected_messages: buffer.rejected,
            undelivered_messages: buffer.len,
            sessions: health.sessions,
        }
    }
}

/// # Pipeline Coordinator
///
/// Builds a pipeline from a validated config and a sink. `start` hands back a
/// `PipelineHandle`.
#[derive(Debug)]
pub struct PipelineCoordinator<S> {
    config: IngestorConfig,
    sink: Arc<S>,
}

impl<S: BatchSink> PipelineCoordinator<S> {
    /// Creates a coordinator that will deliver through `sink`.
    pub fn new(config: IngestorConfig, sink: S) -> Self {
        Self {
            config,
            sink: Arc::new(sink),
        }
    }

    /// # Start
    ///
    /// Spawns the connector, the forwarder and their supervisor on the current
    /// tokio runtime.
    pub fn start(self) -> PipelineHandle {
        let config = self.config;
        let backoff = config.backoff.policy();
        let health = PipelineHealth::new();
        let buffer = Arc::new(DeliveryBuffer::new(config.buffer.capacity, config.buffer.overflow));
        let sequences = Arc::new(SequenceGenerator::new());
        let (control, commands) = ConnectorControl::channel(CONTROL_CHANNEL_CAPACITY);

        let connector = UpstreamConnector::new(
            config.upstream.clone(),
            backoff.clone(),
            Arc::clone(&buffer),
            sequences,
            health.clone(),
            commands,
        );
        let forwarder = BatchForwarder::new(
            self.sink,
            Arc::clone(&buffer),
            config.batch,
            config.retry,
            backoff.clone(),
            health.clone(),
        );

        log::info!(
            "Starting pipeline {} -> {} (capacity {}, overflow {}, batches of {} / {} bytes / {:?})",
            config.upstream.uri,
            config.downstream.uri,
            config.buffer.capacity,
            config.buffer.overflow,
            config.batch.max_count,
            config.batch.max_bytes,
            config.batch.timeout
        );

        let shutdown = CancellationToken::new();
        let supervisor = Supervisor {
            connector,
            forwarder,
            buffer: Arc::clone(&buffer),
            health: health.clone(),
            backoff,
            max_unit_restarts: config.max_unit_restarts,
            shutdown_timeout: config.shutdown_timeout,
            shutdown: shutdown.clone(),
            units: CancellationToken::new(),
            drain: CancellationToken::new(),
        };

        PipelineHandle {
            health,
            control,
            buffer,
            shutdown,
            task: tokio::spawn(supervisor.run()),
        }
    }
}

/// # Pipeline Handle
///
/// The process-facing side of a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    health: PipelineHealth,
    control: ConnectorControl,
    buffer: Arc<DeliveryBuffer>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<PipelineReport, FatalPipelineError>>,
}

/// Health and buffer counters of a running pipeline, for status endpoints.
#[derive(Debug, Clone)]
pub struct PipelineProbe {
    health: PipelineHealth,
    buffer: Arc<DeliveryBuffer>,
}

impl PipelineProbe {
    /// Current health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Current coarse status.
    pub fn status(&self) -> HealthStatus {
        self.health.status()
    }

    /// Buffer counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

impl PipelineHandle {
    /// Current health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Current coarse status.
    pub fn status(&self) -> HealthStatus {
        self.health.status()
    }

    /// Subscribes to health changes.
    pub fn subscribe_health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.subscribe()
    }

    /// Command handle for the connector (stop / start / restart).
    pub fn control(&self) -> ConnectorControl {
        self.control.clone()
    }

    /// Buffer counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// A cloneable read-only view that outlives `wait` and `stop`.
    pub fn probe(&self) -> PipelineProbe {
        PipelineProbe {
            health: self.health.clone(),
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// A token that triggers a graceful stop when cancelled.
    pub fn shutdown_trigger(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests a graceful stop and waits for it.
    pub async fn stop(self) -> Result<PipelineReport, FatalPipelineError> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Waits for the pipeline to end, either gracefully or with a fatal error.
    pub async fn wait(self) -> Result<PipelineReport, FatalPipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                let fatal = FatalPipelineError::Supervisor(describe(&e));
                self.health.set_fatal(fatal.to_string());
                self.health.mark_stopped();
                Err(fatal)
            }
        }
    }
}

fn describe(error: &JoinError) -> String {
    if error.is_panic() {
        "panicked".to_string()
    } else {
        "was cancelled".to_string()
    }
}

/// Awaits the task in `slot`, emptying the slot once it finished. Pending forever
/// when the slot is empty.
async fn join_unit<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match slot.as_mut() {
        Some(handle) => {
            let joined = handle.await;
            *slot = None;
            joined
        }
        None => std::future::pending().await,
    }
}

/// Per-unit crash bookkeeping.
struct Restarts {
    unit: UnitKind,
    count: u32,
    due: Option<Instant>,
}

impl Restarts {
    fn new(unit: UnitKind) -> Self {
        Self { unit, count: 0, due: None }
    }

    /// Schedules a restart after `fault`, or fails once the budget is spent.
    fn schedule(&mut self, fault: &str, backoff: &BackoffPolicy, max: u32) -> Result<(), FatalPipelineError> {
        if self.count >= max {
            log::error!("The {} {fault} and has no restarts left", self.unit);
            return Err(FatalPipelineError::RestartsExhausted {
                unit: self.unit,
                restarts: self.count,
            });
        }
        let delay = backoff.delay(self.count);
        self.count += 1;
        self.due = Some(Instant::now() + delay);
        log::error!(
            "The {} {fault}. Restart {}/{} in {:?}",
            self.unit,
            self.count,
            max,
            delay
        );
        Ok(())
    }
}

struct Supervisor<S> {
    connector: UpstreamConnector,
    forwarder: BatchForwarder<S>,
    buffer: Arc<DeliveryBuffer>,
    health: PipelineHealth,
    backoff: BackoffPolicy,
    max_unit_restarts: u32,
    shutdown_timeout: Duration,
    /// Graceful stop requested by the owner.
    shutdown: CancellationToken,
    /// Parent of every unit token.
    units: CancellationToken,
    /// Switches the forwarder into drain mode.
    drain: CancellationToken,
}

impl<S: BatchSink> Supervisor<S> {
    fn spawn_connector(&self, cancel: &CancellationToken) -> JoinHandle<Result<(), FatalPipelineError>> {
        let connector = self.connector.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { connector.run(cancel).await })
    }

    fn spawn_forwarder(&self, cancel: &CancellationToken) -> JoinHandle<Result<ForwarderExit, FatalPipelineError>> {
        let forwarder = self.forwarder.clone();
        let (cancel, drain) = (cancel.clone(), self.drain.clone());
        tokio::spawn(async move { forwarder.run(cancel, drain).await })
    }

    async fn run(self) -> Result<PipelineReport, FatalPipelineError> {
        let connector_cancel = self.units.child_token();
        let forwarder_cancel = self.units.child_token();
        let mut connector = Some(self.spawn_connector(&connector_cancel));
        let mut forwarder = Some(self.spawn_forwarder(&forwarder_cancel));
        let mut connector_restarts = Restarts::new(UnitKind::Connector);
        let mut forwarder_restarts = Restarts::new(UnitKind::Forwarder);

        let outcome: Result<(), FatalPipelineError> = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("Graceful shutdown requested");
                    break Ok(());
                }
                joined = join_unit(&mut connector) => {
                    let fault = match joined {
                        Ok(Err(fatal)) => break Err(fatal),
                        Ok(Ok(())) => "exited unexpectedly".to_string(),
                        Err(e) => describe(&e),
                    };
                    if let Err(fatal) = connector_restarts.schedule(&fault, &self.backoff, self.max_unit_restarts) {
                        break Err(fatal);
                    }
                }
                joined = join_unit(&mut forwarder) => {
                    let fault = match joined {
                        Ok(Err(fatal)) => break Err(fatal),
                        Ok(Ok(exit)) => format!("exited unexpectedly ({exit:?})"),
                        Err(e) => describe(&e),
                    };
                    if let Err(fatal) = forwarder_restarts.schedule(&fault, &self.backoff, self.max_unit_restarts) {
                        break Err(fatal);
                    }
                }
                _ = sleep_until(connector_restarts.due.unwrap_or_else(Instant::now)), if connector_restarts.due.is_some() => {
                    connector_restarts.due = None;
                    log::info!("Restarting the connector");
                    connector = Some(self.spawn_connector(&connector_cancel));
                }
                _ = sleep_until(forwarder_restarts.due.unwrap_or_else(Instant::now)), if forwarder_restarts.due.is_some() => {
                    forwarder_restarts.due = None;
                    log::info!("Restarting the forwarder, replaying {} buffered envelopes", self.buffer.len());
                    forwarder = Some(self.spawn_forwarder(&forwarder_cancel));
                }
            }
        };

        if let Err(fatal) = &outcome {
            log::error!("Pipeline failed: {fatal}");
            self.health.set_fatal(fatal.to_string());
        }

        // A halted forwarder cannot drain; anything else gets the chance to.
        let halted = matches!(outcome, Err(FatalPipelineError::DeliveryFailed { .. }));
        let drain_failure = self
            .wind_down(&mut connector, &connector_cancel, &mut forwarder, &forwarder_cancel, !halted)
            .await;

        let report = PipelineReport::collect(&self.health.snapshot(), &self.buffer.stats());
        let outcome = match (outcome, drain_failure) {
            (Err(fatal), _) | (Ok(()), Some(fatal)) => Err(fatal),
            (Ok(()), None) => Ok(()),
        };
        if let Err(fatal) = &outcome {
            self.health.set_fatal(fatal.to_string());
        }
        self.health.mark_stopped();

        log::info!(
            "Pipeline stopped: {} messages in {} batches delivered, {} batches dropped, {} evicted, {} rejected, {} undelivered",
            report.delivered_messages,
            report.delivered_batches,
            report.dropped_batches,
            report.evicted_messages,
            report.rejected_messages,
            report.undelivered_messages
        );
        outcome.map(|()| report)
    }

    /// Stops the connector, then drains the buffer through the forwarder within
    /// the shutdown timeout. Returns a fatal error raised while draining.
    async fn wind_down(
        &self,
        connector: &mut Option<JoinHandle<Result<(), FatalPipelineError>>>,
        connector_cancel: &CancellationToken,
        forwarder: &mut Option<JoinHandle<Result<ForwarderExit, FatalPipelineError>>>,
        forwarder_cancel: &CancellationToken,
        drain: bool,
    ) -> Option<FatalPipelineError> {
        connector_cancel.cancel();
        if let Some(handle) = connector.take() {
            settle(UnitKind::Connector, handle, self.shutdown_timeout).await;
        }
        self.buffer.close();

        if !drain {
            forwarder_cancel.cancel();
            if let Some(handle) = forwarder.take() {
                settle(UnitKind::Forwarder, handle, self.shutdown_timeout).await;
            }
            return None;
        }

        if forwarder.is_none() && !self.buffer.is_empty() {
            *forwarder = Some(self.spawn_forwarder(forwarder_cancel));
        }
        self.drain.cancel();

        let handle = forwarder.as_mut()?;
        log::info!("Draining {} buffered envelopes", self.buffer.len());
        let joined = match timeout(self.shutdown_timeout, &mut *handle).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!(
                    "Drain did not finish within {:?}, abandoning {} envelopes",
                    self.shutdown_timeout,
                    self.buffer.len()
                );
                forwarder_cancel.cancel();
                handle.await
            }
        };
        *forwarder = None;

        match joined {
            Ok(Ok(_)) => None,
            Ok(Err(fatal)) => Some(fatal),
            Err(e) => {
                log::error!("The forwarder {} while draining", describe(&e));
                None
            }
        }
    }
}

/// Waits for a cancelled unit to finish, aborting it if it does not within `grace`.
async fn settle<T>(unit: UnitKind, mut handle: JoinHandle<T>, grace: Duration) {
    if timeout(grace, &mut handle).await.is_err() {
        log::warn!("The {unit} did not stop within {grace:?}, aborting it");
        handle.abort();
    }
}
