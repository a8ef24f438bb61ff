//! # Ingestor Server
//!
//! Relays an upstream websocket feed to a downstream HTTP endpoint in ordered,
//! acknowledged batches, with an admin REST surface on the side.
//!
//! Exit code 0 after a graceful stop, 1 after a configuration error or a
//! terminal pipeline failure.

use std::process::ExitCode;

use clap::Parser;
use lib_ingestor::loggers::{parse_level, setup_logging};
use lib_ingestor::pipeline::PipelineCoordinator;
use lib_ingestor::retrieve::HttpBatchSink;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod ingestor_logic;
use ingestor_logic::{admin, config};

const APP_NAME: &str = "server_ingestor";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = config::Args::parse();

    let config = match config::load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            let level = parse_level(args.log_level.as_deref().unwrap_or("info"));
            if setup_logging(APP_NAME, None, level).is_ok() {
                log::error!("Configuration error: {e}");
            } else {
                eprintln!("Configuration error: {e}");
            }
            return ExitCode::FAILURE;
        }
    };

    match setup_logging(APP_NAME, config.log_dir.as_deref(), parse_level(&config.log_level)) {
        Ok(Some(file)) => log::info!("Logging to {}", file.display()),
        Ok(None) => {}
        Err(e) => {
            eprintln!("Failed to set up logging: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    let sink = match HttpBatchSink::from_config(&config.pipeline.downstream) {
        Ok(sink) => sink,
        Err(e) => {
            log::error!("Failed to build the downstream client: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let handle = PipelineCoordinator::new(config.pipeline, sink).start();
    let shutdown = handle.shutdown_trigger();
    let admin_shutdown = CancellationToken::new();

    let admin_task = if config.admin_port == 0 {
        log::info!("Admin server disabled.");
        None
    } else {
        let state = admin::AdminState {
            probe: handle.probe(),
            control: handle.control(),
        };
        let port = config.admin_port;
        let token = admin_shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = admin::run(port, state, token).await {
                log::error!("Admin server failed: {e:#}");
            }
        }))
    };

    let signals = tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    let result = handle.wait().await;
    signals.abort();
    admin_shutdown.cancel();
    if let Some(task) = admin_task {
        let _ = task.await;
    }

    match result {
        Ok(report) => {
            log::info!(
                "Shutdown complete: {} messages in {} batches delivered, {} left undelivered.",
                report.delivered_messages,
                report.delivered_batches,
                report.undelivered_messages
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Pipeline failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                log::warn!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {e}");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}
