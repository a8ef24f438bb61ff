//! Pushes a burst of messages through a local feed, the full pipeline and a
//! local sink, and reports the end-to-end relay rate.

use std::time::{Duration, Instant};

use clap::Parser;
use lib_ingestor::configs::IngestorSettings;
use lib_ingestor::loggers::{parse_level, setup_logging};
use lib_ingestor::pipeline::PipelineCoordinator;
use lib_ingestor::retrieve::HttpBatchSink;
use project_tests::{eventually, Feed, Sink};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Messages to relay
    #[clap(short, long, default_value_t = 100_000)]
    messages: u64,

    /// Messages per batch
    #[clap(short, long, default_value_t = 500)]
    batch: usize,

    /// Buffer capacity
    #[clap(short, long, default_value_t = 10_000)]
    capacity: usize,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 1)]
    report_interval_seconds: u64,

    /// Log level
    #[clap(short, long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging("test_ingestor_throughput", None, parse_level(&args.log_level))?;

    let feed = Feed::start().await?;
    let sink = Sink::start().await?;
    let config = IngestorSettings {
        upstream_uri: Some(feed.url.clone()),
        downstream_uri: Some(sink.url.clone()),
        buffer_capacity: Some(args.capacity),
        max_batch_count: Some(args.batch),
        batch_timeout_ms: Some(50),
        ..Default::default()
    }
    .into_config()?;
    let downstream = HttpBatchSink::from_config(&config.downstream)?;
    let handle = PipelineCoordinator::new(config, downstream).start();

    if !eventually(Duration::from_secs(10), || feed.connections() == 1).await {
        anyhow::bail!("pipeline never connected to the local feed");
    }

    let started = Instant::now();
    feed.send_numbers(1..=args.messages);

    let reporter = {
        let sink = sink.clone();
        let interval = Duration::from_secs(args.report_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut last = 0usize;
            loop {
                tokio::time::sleep(interval).await;
                let delivered = sink.numbers().len();
                println!(
                    "--- {:>8.1}s: {} delivered, {:.0} msg/s, {} batches",
                    started.elapsed().as_secs_f64(),
                    delivered,
                    (delivered - last) as f64 / interval.as_secs_f64(),
                    sink.batches().len()
                );
                last = delivered;
            }
        })
    };

    let target = args.messages as usize;
    let done = eventually(Duration::from_secs(600), || sink.numbers().len() >= target).await;
    reporter.abort();
    let elapsed = started.elapsed();

    let numbers = sink.numbers();
    let in_order = numbers.iter().zip(1u64..).all(|(n, expected)| *n == expected);
    let report = handle.stop().await?;

    println!("Relayed {} of {} messages in {:?}", numbers.len(), args.messages, elapsed);
    println!(
        "Average {:.0} msg/s, {} batches, order {}",
        numbers.len() as f64 / elapsed.as_secs_f64(),
        report.delivered_batches,
        if in_order { "preserved" } else { "VIOLATED" }
    );

    if !done || !in_order {
        anyhow::bail!("relay incomplete or out of order");
    }
    Ok(())
}
