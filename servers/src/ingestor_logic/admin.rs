//! Admin REST surface: health, buffer counters and connector commands.

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use lib_ingestor::core::health::{HealthSnapshot, HealthStatus};
use lib_ingestor::ingestors::{AckResult, CommandAck, ConnectorControl};
use lib_ingestor::pipeline::PipelineProbe;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AdminState {
    pub probe: PipelineProbe,
    pub control: ConnectorControl,
}

#[derive(Serialize)]
struct HealthBody {
    status: HealthStatus,
    #[serde(flatten)]
    snapshot: HealthSnapshot,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/buffer", get(buffer_handler))
        .route("/admin/websocket/stop", get(stop_handler))
        .route("/admin/websocket/start", get(start_handler))
        .route("/admin/websocket/restart", get(restart_handler))
        .with_state(state)
}

/// Serves the admin routes until `shutdown` is cancelled.
pub async fn run(port: u16, state: AdminState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Admin server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Admin server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.probe.health();
    let status = snapshot.status();
    let code = if status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(HealthBody { status, snapshot }))
}

async fn buffer_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.probe.buffer_stats())
}

async fn stop_handler(State(state): State<AdminState>) -> impl IntoResponse {
    command_reply("stopped", state.control.stop().await)
}

async fn start_handler(State(state): State<AdminState>) -> impl IntoResponse {
    command_reply("started", state.control.start().await)
}

async fn restart_handler(State(state): State<AdminState>) -> impl IntoResponse {
    command_reply("restarted", state.control.restart().await)
}

fn command_reply(done: &str, result: AckResult) -> (StatusCode, Json<serde_json::Value>) {
    match result {
        Ok(CommandAck::Applied) => {
            log::info!("Admin: websocket {}", done);
            (StatusCode::OK, Json(json!({ "status": done })))
        }
        Ok(CommandAck::AlreadyConnected) => {
            log::info!("Admin: websocket already connected");
            (
                StatusCode::OK,
                Json(json!({ "status": "already_connected", "message": "websocket already connected" })),
            )
        }
        Err(e) => {
            log::warn!("Admin: websocket command failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "message": e })))
        }
    }
}
