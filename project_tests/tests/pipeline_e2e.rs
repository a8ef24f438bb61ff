//! End-to-end relay tests: a local websocket feed, the full pipeline and a local
//! HTTP sink.

use std::time::Duration;

use lib_ingestor::configs::{IngestorConfig, IngestorSettings};
use lib_ingestor::core::errors::FatalPipelineError;
use lib_ingestor::core::health::{ConnectionState, HealthStatus};
use lib_ingestor::pipeline::{PipelineCoordinator, PipelineHandle};
use lib_ingestor::retrieve::HttpBatchSink;
use project_tests::{eventually, Feed, Sink};

const LIMIT: Duration = Duration::from_secs(10);

fn settings(feed: &Feed, sink: &Sink) -> IngestorSettings {
    IngestorSettings {
        upstream_uri: Some(feed.url.clone()),
        downstream_uri: Some(sink.url.clone()),
        batch_timeout_ms: Some(20),
        backoff_base_ms: Some(20),
        backoff_cap_ms: Some(100),
        backoff_jitter: Some(0.0),
        request_timeout_ms: Some(2_000),
        shutdown_timeout_ms: Some(2_000),
        ..Default::default()
    }
}

fn start(config: IngestorConfig) -> PipelineHandle {
    let sink = HttpBatchSink::from_config(&config.downstream).unwrap();
    PipelineCoordinator::new(config, sink).start()
}

async fn connected(handle: &PipelineHandle) {
    assert!(
        eventually(LIMIT, || handle.health().connection == ConnectionState::Connected).await,
        "pipeline never connected"
    );
}

#[tokio::test]
async fn every_message_arrives_once_and_in_order_under_backpressure() {
    let feed = Feed::start().await.unwrap();
    let sink = Sink::start().await.unwrap();
    let config = IngestorSettings {
        buffer_capacity: Some(16),
        max_batch_count: Some(7),
        ..settings(&feed, &sink)
    }
    .into_config()
    .unwrap();
    let handle = start(config);
    connected(&handle).await;

    feed.send_numbers(1..=500);
    assert!(eventually(LIMIT, || sink.numbers().len() >= 500).await);
    assert_eq!(sink.numbers(), (1..=500).collect::<Vec<u64>>());

    for batch in sink.batches() {
        assert!(!batch.numbers.is_empty() && batch.numbers.len() <= 7);
        let first = batch.numbers[0];
        let last = batch.numbers[batch.numbers.len() - 1];
        assert_eq!(batch.range, format!("{first}-{last}"));
    }

    let report = handle.stop().await.unwrap();
    assert_eq!(report.delivered_messages, 500);
    assert_eq!(report.undelivered_messages, 0);
    assert_eq!(report.evicted_messages, 0);
}

#[tokio::test]
async fn buffered_messages_survive_a_sink_outage_and_an_upstream_reconnect() {
    let feed = Feed::start().await.unwrap();
    let sink = Sink::start().await.unwrap();
    let config = IngestorSettings {
        max_retry_attempts: Some(10_000),
        ..settings(&feed, &sink)
    }
    .into_config()
    .unwrap();
    let handle = start(config);
    connected(&handle).await;

    feed.send_numbers(1..=5);
    assert!(eventually(LIMIT, || sink.numbers().len() == 5).await);
    assert!(eventually(LIMIT, || handle.buffer_stats().acknowledged_up_to == 5).await);

    sink.respond_with(503);
    let attempts_before = sink.attempts();
    feed.send_numbers(6..=8);
    assert!(eventually(LIMIT, || handle.buffer_stats().last_admitted == 8).await);
    assert!(eventually(LIMIT, || sink.attempts() > attempts_before + 1).await);
    assert!(eventually(LIMIT, || handle.status() == HealthStatus::Degraded).await);

    feed.hangup();
    feed.send_numbers(9..=10);
    assert!(eventually(LIMIT, || feed.connections() == 2).await);
    assert!(eventually(LIMIT, || handle.buffer_stats().last_admitted == 10).await);
    assert_eq!(sink.numbers(), vec![1, 2, 3, 4, 5]);

    sink.respond_with(200);
    assert!(eventually(LIMIT, || sink.numbers().len() == 10).await);
    assert_eq!(sink.numbers(), (1..=10).collect::<Vec<u64>>());
    assert!(eventually(LIMIT, || handle.buffer_stats().len == 0).await);

    let report = handle.stop().await.unwrap();
    assert_eq!(report.delivered_messages, 10);
    assert_eq!(report.sessions, 2);
    assert_eq!(report.undelivered_messages, 0);
}

#[tokio::test]
async fn permanent_rejection_halts_the_pipeline() {
    let feed = Feed::start().await.unwrap();
    let sink = Sink::start().await.unwrap();
    sink.respond_with(422);
    let handle = start(settings(&feed, &sink).into_config().unwrap());
    connected(&handle).await;

    let probe = handle.probe();
    feed.send_numbers(1..=3);
    let result = tokio::time::timeout(LIMIT, handle.wait()).await.unwrap();

    match result {
        Err(FatalPipelineError::DeliveryFailed {
            first_sequence,
            last_sequence,
            attempts,
            ..
        }) => {
            assert_eq!(first_sequence, 1);
            assert!(last_sequence <= 3);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected a delivery failure, got {other:?}"),
    }
    assert_eq!(probe.status(), HealthStatus::Unhealthy);
    assert!(probe.health().fatal.is_some());

    let attempts = sink.attempts();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.attempts(), attempts);
    assert!(sink.batches().is_empty());
}

#[tokio::test]
async fn noise_and_control_frames_are_not_relayed() {
    let feed = Feed::start().await.unwrap();
    let sink = Sink::start().await.unwrap();
    let config = IngestorSettings {
        control_frame_types: Some(vec!["welcome".to_string()]),
        ..settings(&feed, &sink)
    }
    .into_config()
    .unwrap();
    let handle = start(config);
    connected(&handle).await;

    feed.send_text(r#"{"type":"welcome"}"#);
    feed.send_text("definitely not json");
    feed.send_numbers(1..=2);
    assert!(eventually(LIMIT, || sink.numbers().len() == 2).await);
    assert_eq!(sink.numbers(), vec![1, 2]);
    assert_eq!(handle.buffer_stats().last_admitted, 2);

    let report = handle.stop().await.unwrap();
    assert_eq!(report.delivered_messages, 2);
}
