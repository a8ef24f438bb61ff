//! # Batch Forwarder
//!
//! Drains the delivery buffer into batches and hands them to a `BatchSink`.
//!
//! A batch is flushed as soon as one of these holds:
//! - `max_count` envelopes are pending,
//! - `max_bytes` payload bytes are pending,
//! - the oldest pending envelope has waited `batch timeout`,
//! - the pipeline is draining.
//!
//! Exactly one batch is in flight at a time. A batch that fails transiently is
//! retried as-is after a backoff delay and nothing new is peeked until it
//! resolves, so delivery order always equals sequence order. Envelopes are only
//! acknowledged (and thereby removed from the buffer) after the sink confirmed
//! them, or after the `drop` fatal policy gave up on them.

use std::sync::Arc;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::configs::{BatchConfig, FatalDeliveryPolicy, RetryConfig};
use crate::core::backoff::BackoffPolicy;
use crate::core::buffer::DeliveryBuffer;
use crate::core::envelope::Batch;
use crate::core::errors::{DeliveryError, FatalPipelineError};
use crate::core::health::{ForwarderState, PipelineHealth};
use crate::core::sink::BatchSink;

/// How the forwarder loop ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderExit {
    /// The buffer was closed and fully drained.
    Drained,
    /// Aborted by cancellation; pending envelopes stay in the buffer.
    Cancelled,
}

/// Retry bookkeeping for the batch currently in flight.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made so far, the first one included.
    pub attempt: u32,
    /// When the next attempt may start.
    pub next_eligible: Option<Instant>,
    /// Error of the latest failed attempt.
    pub last_error: Option<DeliveryError>,
}

impl RetryState {
    fn record_failure(&mut self, error: DeliveryError, delay: std::time::Duration) {
        self.next_eligible = Some(Instant::now() + delay);
        self.last_error = Some(error);
    }
}

enum Flush {
    Ready,
    Drained,
    Cancelled,
}

enum Attempt {
    Delivered(u32),
    Failed(RetryState, DeliveryError),
    Cancelled,
}

/// # Batch Forwarder
///
/// Single reader and acknowledger of a `DeliveryBuffer`.
#[derive(Debug)]
pub struct BatchForwarder<S> {
    sink: Arc<S>,
    buffer: Arc<DeliveryBuffer>,
    batch: BatchConfig,
    retry: RetryConfig,
    backoff: BackoffPolicy,
    health: PipelineHealth,
}

impl<S> Clone for BatchForwarder<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            buffer: Arc::clone(&self.buffer),
            batch: self.batch,
            retry: self.retry,
            backoff: self.backoff.clone(),
            health: self.health.clone(),
        }
    }
}

impl<S: BatchSink> BatchForwarder<S> {
    /// Creates a forwarder. Nothing happens until `run` is awaited.
    pub fn new(
        sink: Arc<S>,
        buffer: Arc<DeliveryBuffer>,
        batch: BatchConfig,
        retry: RetryConfig,
        backoff: BackoffPolicy,
        health: PipelineHealth,
    ) -> Self {
        Self {
            sink,
            buffer,
            batch,
            retry,
            backoff,
            health,
        }
    }

    /// # Run
    ///
    /// Forwards batches until `cancel` fires, or until `drain` has fired and the
    /// closed buffer is empty. Fails only when a batch is undeliverable under the
    /// `halt` policy; the health signal is then `Halted`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        drain: CancellationToken,
    ) -> Result<ForwarderExit, FatalPipelineError> {
        loop {
            match self.wait_for_flush(&cancel, &drain).await {
                Flush::Ready => {}
                Flush::Drained => {
                    log::info!("Delivery buffer drained");
                    return Ok(ForwarderExit::Drained);
                }
                Flush::Cancelled => return Ok(ForwarderExit::Cancelled),
            }

            let Some(batch) = self.buffer.peek_batch(self.batch.max_count, self.batch.max_bytes) else {
                continue;
            };

            match self.deliver_with_retry(&batch, &cancel).await {
                Attempt::Delivered(attempts) => {
                    self.buffer.acknowledge(batch.last_sequence());
                    self.health.record_delivery(batch.len());
                    log::debug!(
                        "Delivered batch {}..={} ({} envelopes, {} bytes) after {} attempt(s)",
                        batch.first_sequence(),
                        batch.last_sequence(),
                        batch.len(),
                        batch.total_bytes(),
                        attempts
                    );
                }
                Attempt::Failed(retry, error) => self.give_up(&batch, retry, error)?,
                Attempt::Cancelled => return Ok(ForwarderExit::Cancelled),
            }
        }
    }

    /// Waits until a flush condition holds.
    async fn wait_for_flush(&self, cancel: &CancellationToken, drain: &CancellationToken) -> Flush {
        loop {
            let changed = self.buffer.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let view = self.buffer.flush_view();
            let draining = drain.is_cancelled();
            self.health.set_forwarder(if draining {
                ForwarderState::Draining
            } else {
                ForwarderState::Idle
            });

            if view.len == 0 {
                if draining && view.closed {
                    return Flush::Drained;
                }
            } else if draining || view.len >= self.batch.max_count || view.bytes >= self.batch.max_bytes {
                return Flush::Ready;
            }

            let deadline = view.oldest_enqueued_at.map(|at| at + self.batch.timeout);
            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Flush::Ready;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Flush::Cancelled,
                _ = drain.cancelled(), if !draining => {}
                _ = &mut changed => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }
    }

    /// Delivers `batch`, retrying transient failures within the retry budget.
    async fn deliver_with_retry(&self, batch: &Batch, cancel: &CancellationToken) -> Attempt {
        let mut retry = RetryState::default();
        loop {
            if let Some(at) = retry.next_eligible {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    _ = sleep_until(at) => {}
                }
            }

            self.health.set_forwarder(ForwarderState::Delivering);
            self.buffer.mark_attempted(batch.last_sequence());
            retry.attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled,
                result = self.sink.deliver(batch) => result,
            };

            let error = match result {
                Ok(()) => return Attempt::Delivered(retry.attempt),
                Err(error) => error,
            };

            if !error.is_transient() || retry.attempt > self.retry.max_retry_attempts {
                return Attempt::Failed(retry, error);
            }

            let delay = self.backoff.delay(retry.attempt - 1);
            log::warn!(
                "Batch {}..={} attempt {} failed: {}. Retrying in {:?}",
                batch.first_sequence(),
                batch.last_sequence(),
                retry.attempt,
                error,
                delay
            );
            retry.record_failure(error, delay);
            self.health.set_forwarder(ForwarderState::Retrying { attempt: retry.attempt });
        }
    }

    /// Applies the fatal delivery policy to a batch that will never be delivered.
    fn give_up(&self, batch: &Batch, retry: RetryState, error: DeliveryError) -> Result<(), FatalPipelineError> {
        let why = if error.is_transient() {
            "retries exhausted"
        } else {
            "permanent failure"
        };

        match self.retry.fatal_policy {
            FatalDeliveryPolicy::Drop => {
                log::error!(
                    "Dropping batch {}..={} ({} envelopes) after {} attempt(s), {}: {}",
                    batch.first_sequence(),
                    batch.last_sequence(),
                    batch.len(),
                    retry.attempt,
                    why,
                    error
                );
                self.buffer.acknowledge(batch.last_sequence());
                self.health.record_dropped_batch();
                Ok(())
            }
            FatalDeliveryPolicy::Halt => {
                let fatal = FatalPipelineError::DeliveryFailed {
                    first_sequence: batch.first_sequence(),
                    last_sequence: batch.last_sequence(),
                    attempts: retry.attempt,
                    last: error,
                };
                log::error!("Halting delivery, {why}: {fatal}");
                self.health.set_forwarder(ForwarderState::Halted);
                self.health.set_fatal(fatal.to_string());
                Err(fatal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::OverflowPolicy;
    use crate::core::envelope::MessageEnvelope;
    use crate::core::health::HealthStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedSink {
        script: Mutex<VecDeque<Result<(), DeliveryError>>>,
        attempts: Mutex<Vec<(Instant, Vec<u64>)>>,
    }

    impl ScriptedSink {
        fn with_script(script: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::default(),
            })
        }

        fn attempts(&self) -> Vec<Vec<u64>> {
            self.attempts.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
        }

        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    impl BatchSink for ScriptedSink {
        async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
            let sequences = batch.envelopes().iter().map(|e| e.sequence()).collect();
            self.attempts.lock().unwrap().push((Instant::now(), sequences));
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    struct Setup {
        sink: Arc<ScriptedSink>,
        buffer: Arc<DeliveryBuffer>,
        health: PipelineHealth,
        cancel: CancellationToken,
        drain: CancellationToken,
        task: tokio::task::JoinHandle<Result<ForwarderExit, FatalPipelineError>>,
    }

    fn batch_config(max_count: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            max_count,
            max_bytes: 1 << 20,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn retry_config(max_retry_attempts: u32, fatal_policy: FatalDeliveryPolicy) -> RetryConfig {
        RetryConfig {
            max_retry_attempts,
            fatal_policy,
        }
    }

    fn start(sink: Arc<ScriptedSink>, buffer: Arc<DeliveryBuffer>, batch: BatchConfig, retry: RetryConfig) -> Setup {
        let health = PipelineHealth::new();
        let forwarder = BatchForwarder::new(
            Arc::clone(&sink),
            Arc::clone(&buffer),
            batch,
            retry,
            BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1), 0.0, None),
            health.clone(),
        );
        let cancel = CancellationToken::new();
        let drain = CancellationToken::new();
        let task = {
            let (cancel, drain) = (cancel.clone(), drain.clone());
            tokio::spawn(async move { forwarder.run(cancel, drain).await })
        };
        Setup {
            sink,
            buffer,
            health,
            cancel,
            drain,
            task,
        }
    }

    async fn push_range(buffer: &DeliveryBuffer, range: std::ops::RangeInclusive<u64>) {
        for sequence in range {
            buffer
                .push(MessageEnvelope::new(sequence, format!(r#"{{"n":{sequence}}}"#)))
                .await
                .unwrap();
        }
    }

    fn buffer(capacity: usize) -> Arc<DeliveryBuffer> {
        Arc::new(DeliveryBuffer::new(capacity, OverflowPolicy::Block))
    }

    #[tokio::test(start_paused = true)]
    async fn count_trigger_flushes_without_waiting() {
        let s = start(
            ScriptedSink::with_script(vec![]),
            buffer(100),
            batch_config(3, 10_000),
            retry_config(5, FatalDeliveryPolicy::Halt),
        );
        let started = Instant::now();
        push_range(&s.buffer, 1..=3).await;

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(s.sink.attempts(), vec![vec![1, 2, 3]]);
        assert!(s.sink.attempt_times()[0] - started < Duration::from_millis(10));
        assert!(s.buffer.is_empty());
        s.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_trigger_flushes_a_partial_batch() {
        let s = start(
            ScriptedSink::with_script(vec![]),
            buffer(200),
            batch_config(100, 50),
            retry_config(5, FatalDeliveryPolicy::Halt),
        );
        push_range(&s.buffer, 1..=1).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(s.sink.attempts().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.sink.attempts(), vec![vec![1]]);
        assert_eq!(s.health.snapshot().delivered_messages, 1);
        s.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn byte_limit_splits_batches() {
        let buffer = buffer(100);
        push_range(&buffer, 1..=4).await;
        let s = start(
            ScriptedSink::with_script(vec![]),
            buffer,
            BatchConfig {
                max_count: 100,
                max_bytes: 14,
                timeout: Duration::from_secs(10),
            },
            retry_config(5, FatalDeliveryPolicy::Halt),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        // Each payload is 7 bytes.
        assert_eq!(s.sink.attempts(), vec![vec![1, 2], vec![3, 4]]);
        s.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_everything_in_order() {
        let buffer = buffer(100);
        push_range(&buffer, 1..=10).await;
        let s = start(
            ScriptedSink::with_script(vec![]),
            buffer,
            batch_config(3, 50),
            retry_config(5, FatalDeliveryPolicy::Halt),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            s.sink.attempts(),
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10]]
        );
        assert!(s.buffer.is_empty());
        assert_eq!(s.health.snapshot().delivered_batches, 4);
        s.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_the_same_batch_with_backoff() {
        let sink = ScriptedSink::with_script(vec![
            Err(DeliveryError::transient("connection reset")),
            Err(DeliveryError::from_status(503, "busy")),
        ]);
        let buffer = buffer(100);
        push_range(&buffer, 1..=5).await;
        let s = start(sink, buffer, batch_config(3, 50), retry_config(5, FatalDeliveryPolicy::Halt));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.health.snapshot().forwarder, ForwarderState::Retrying { attempt: 1 });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.health.snapshot().forwarder, ForwarderState::Retrying { attempt: 2 });
        assert_eq!(s.buffer.pending_sequences(), vec![1, 2, 3, 4, 5]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            s.sink.attempts(),
            vec![vec![1, 2, 3], vec![1, 2, 3], vec![1, 2, 3], vec![4, 5]]
        );
        let times = s.sink.attempt_times();
        assert_eq!(times[1] - times[0], Duration::from_millis(100));
        assert_eq!(times[2] - times[1], Duration::from_millis(200));
        assert!(s.buffer.is_empty());
        s.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_halts_under_halt_policy() {
        let sink = ScriptedSink::with_script(vec![Err(DeliveryError::from_status(400, "bad payload"))]);
        let buffer = buffer(100);
        push_range(&buffer, 1..=3).await;
        let s = start(sink, buffer, batch_config(3, 50), retry_config(5, FatalDeliveryPolicy::Halt));

        let result = s.task.await.unwrap();
        match result {
            Err(FatalPipelineError::DeliveryFailed {
                first_sequence,
                last_sequence,
                attempts,
                ..
            }) => assert_eq!((first_sequence, last_sequence, attempts), (1, 3, 1)),
            other => panic!("expected a halted forwarder, got {other:?}"),
        }
        assert_eq!(s.health.status(), HealthStatus::Unhealthy);
        assert_eq!(s.health.snapshot().forwarder, ForwarderState::Halted);

        push_range(&s.buffer, 4..=6).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(s.sink.attempts().len(), 1);
        assert_eq!(s.buffer.pending_sequences(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_the_batch_under_drop_policy() {
        let sink = ScriptedSink::with_script(vec![
            Err(DeliveryError::transient("down")),
            Err(DeliveryError::transient("down")),
            Err(DeliveryError::transient("down")),
        ]);
        let buffer = buffer(100);
        push_range(&buffer, 1..=4).await;
        let s = start(sink, buffer, batch_config(2, 50), retry_config(2, FatalDeliveryPolicy::Drop));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            s.sink.attempts(),
            vec![vec![1, 2], vec![1, 2], vec![1, 2], vec![3, 4]]
        );
        let snapshot = s.health.snapshot();
        assert_eq!(snapshot.dropped_batches, 1);
        assert_eq!(snapshot.delivered_messages, 2);
        assert!(s.buffer.is_empty());
        assert!(!s.task.is_finished());
        s.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_flushes_immediately_then_exits() {
        let s = start(
            ScriptedSink::with_script(vec![]),
            buffer(100),
            batch_config(100, 60_000),
            retry_config(5, FatalDeliveryPolicy::Halt),
        );
        push_range(&s.buffer, 1..=2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(s.sink.attempts().is_empty());

        let started = Instant::now();
        s.buffer.close();
        s.drain.cancel();
        let exit = s.task.await.unwrap().unwrap();
        assert_eq!(exit, ForwarderExit::Drained);
        assert_eq!(s.sink.attempts(), vec![vec![1, 2]]);
        assert!(Instant::now() - started < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_the_retry_and_keeps_envelopes() {
        let sink = ScriptedSink::with_script(vec![Err(DeliveryError::transient("down"))]);
        let buffer = buffer(100);
        push_range(&buffer, 1..=3).await;
        let s = start(sink, buffer, batch_config(3, 50), retry_config(5, FatalDeliveryPolicy::Halt));

        tokio::time::sleep(Duration::from_millis(10)).await;
        s.cancel.cancel();
        assert_eq!(s.task.await.unwrap().unwrap(), ForwarderExit::Cancelled);
        assert_eq!(s.buffer.pending_sequences(), vec![1, 2, 3]);

        let batch = s.buffer.peek_batch(3, usize::MAX).unwrap();
        assert!(batch.envelopes().iter().all(|e| e.attempts() == 1));
    }
}
