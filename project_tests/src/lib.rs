//! # Local Relay Harness
//!
//! A scriptable websocket feed and an HTTP sink, both bound to ephemeral local
//! ports, used by the end-to-end tests and the throughput runner.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// What the feed does next on its current connection.
#[derive(Debug, Clone)]
pub enum FeedCommand {
    /// Send a text frame.
    Text(String),
    /// Drop the TCP connection without a close handshake.
    Hangup,
}

/// # Feed
///
/// A websocket server that serves one connection at a time. Commands queued while
/// no connection is open are picked up by the next one.
pub struct Feed {
    /// `ws://` URL of the feed.
    pub url: String,
    commands: mpsc::UnboundedSender<FeedCommand>,
    connections: Arc<AtomicUsize>,
}

impl Feed {
    /// Binds the feed on an ephemeral port.
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}/feed", listener.local_addr()?);
        let (commands, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let rx = Arc::clone(&rx);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    let mut rx = rx.lock().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    loop {
                        tokio::select! {
                            command = rx.recv() => match command {
                                Some(FeedCommand::Text(text)) => {
                                    if ws.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(FeedCommand::Hangup) | None => break,
                            },
                            inbound = ws.next() => match inbound {
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                        }
                    }
                });
            }
        });

        Ok(Self {
            url,
            commands,
            connections,
        })
    }

    /// Queues a raw text frame.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(FeedCommand::Text(text.into()));
    }

    /// Queues `{"n": n}` for every `n` in `range`.
    pub fn send_numbers(&self, range: impl IntoIterator<Item = u64>) {
        for n in range {
            self.send_text(serde_json::json!({ "n": n }).to_string());
        }
    }

    /// Drops the current connection.
    pub fn hangup(&self) {
        let _ = self.commands.send(FeedCommand::Hangup);
    }

    /// Connections that completed the websocket handshake so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SinkState {
    status: AtomicU16,
    attempts: AtomicUsize,
    batches: Mutex<Vec<AcceptedBatch>>,
}

/// One batch the sink answered with a success status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedBatch {
    /// Value of the `x-batch-sequence-range` header.
    pub range: String,
    /// The `"n"` field of every element, in body order.
    pub numbers: Vec<u64>,
}

/// # Sink
///
/// An HTTP endpoint that answers every batch with a switchable status code and
/// records the batches it accepted.
#[derive(Clone)]
pub struct Sink {
    /// `http://` URL of the ingest route.
    pub url: String,
    state: Arc<SinkState>,
}

impl Sink {
    /// Binds the sink on an ephemeral port, answering 200.
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(SinkState {
            status: AtomicU16::new(200),
            ..Default::default()
        });
        let app = Router::new()
            .route("/ingest", post(ingest))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/ingest", listener.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("sink stopped: {e}");
            }
        });
        Ok(Self { url, state })
    }

    /// Status code returned from now on.
    pub fn respond_with(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    /// Requests received, accepted or not.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Accepted batches in arrival order.
    pub fn batches(&self) -> Vec<AcceptedBatch> {
        self.state.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Every accepted number in arrival order.
    pub fn numbers(&self) -> Vec<u64> {
        self.batches().into_iter().flat_map(|b| b.numbers).collect()
    }
}

async fn ingest(State(state): State<Arc<SinkState>>, headers: HeaderMap, Json(body): Json<Vec<Value>>) -> StatusCode {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK);
    if status.is_success() {
        let range = headers
            .get("x-batch-sequence-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let numbers = body.iter().filter_map(|item| item["n"].as_u64()).collect();
        if let Ok(mut batches) = state.batches.lock() {
            batches.push(AcceptedBatch { range, numbers });
        }
    }
    status
}

/// Polls `condition` every 10ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
