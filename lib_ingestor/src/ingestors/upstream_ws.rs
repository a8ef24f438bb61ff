//! # Upstream Websocket Connector
//!
//! Maintains at most one live websocket session to the configured upstream and
//! converts inbound frames into `MessageEnvelope`s.
//!
//! ## Session lifecycle:
//!
//! `Disconnected → Connecting → (Authenticating) → Connected`, then on any I/O
//! error, a close frame or a missed heartbeat `→ Failed →` backoff `→ Connecting`.
//! A stop request or cancellation moves through `Draining` to `Disconnected`.
//!
//! ## Frames:
//!
//! - Text and binary frames must hold UTF-8 JSON. Anything else is a protocol
//!   error: the frame is dropped with a warning and the session is only recycled
//!   after too many malformed frames in a row.
//! - JSON objects whose `"type"` is a configured control type are consumed here.
//! - Websocket `Ping` is answered with `Pong`. Every inbound frame refreshes the
//!   heartbeat clock.
//!
//! Valid frames get the next sequence number and are pushed into the buffer.
//! Under the `block` overflow policy the receive loop waits for space, which in
//! turn stops reading from the socket and lets TCP flow control push back on the
//! upstream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::configs::UpstreamConfig;
use crate::core::backoff::BackoffPolicy;
use crate::core::buffer::{DeliveryBuffer, PushOutcome};
use crate::core::envelope::{MessageEnvelope, SequenceGenerator};
use crate::core::errors::{BufferError, ConnectError, FatalPipelineError, ProtocolError};
use crate::core::health::{ConnectionState, PipelineHealth};
use crate::retrieve::ky_http::{ApiClient, ApiResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;

/// How long `ConnectorControl::send` waits for an acknowledgement by default.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// What the connector did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAck {
    /// The command was carried out.
    Applied,
    /// `Start` arrived while a session was already live. Nothing changed.
    AlreadyConnected,
}

/// Result type for command acknowledgements.
pub type AckResult = Result<CommandAck, String>;

/// Runtime commands for the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorCommand {
    /// Close the session and stay disconnected until `Start`.
    Stop,
    /// Re-enable the connector and connect if it was stopped.
    Start,
    /// Close the session and reconnect immediately.
    Restart,
}

/// A command together with the channel its acknowledgement goes back on.
#[derive(Debug)]
pub struct UpstreamRequest {
    /// The command.
    pub command: ConnectorCommand,
    /// Receives the outcome once the connector has acted on the command.
    pub responder: oneshot::Sender<AckResult>,
}

/// Sending half of the command channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectorControl {
    tx: mpsc::Sender<UpstreamRequest>,
    ack_timeout: Duration,
}

/// Receiving half of the command channel.
///
/// Shared by every incarnation of a connector, so commands keep working after a
/// crash restart.
#[derive(Debug, Clone)]
pub struct ConnectorCommands {
    rx: Arc<Mutex<mpsc::Receiver<UpstreamRequest>>>,
}

impl ConnectorControl {
    /// Creates a linked control/commands pair.
    pub fn channel(capacity: usize) -> (ConnectorControl, ConnectorCommands) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ConnectorControl {
                tx,
                ack_timeout: DEFAULT_ACK_TIMEOUT,
            },
            ConnectorCommands {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Replaces the acknowledgement deadline used by `send`.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Sends `command` and waits for the connector to acknowledge it. Gives up
    /// with an error once the acknowledgement deadline passes.
    pub async fn send(&self, command: ConnectorCommand) -> AckResult {
        let (responder, reply) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(UpstreamRequest { command, responder })
                .await
                .map_err(|_| "connector is not running".to_string())?;
            reply
                .await
                .map_err(|_| "connector dropped the request".to_string())?
        };
        timeout(self.ack_timeout, exchange).await.unwrap_or_else(|_| {
            Err(format!(
                "connector did not acknowledge {command:?} within {:?}",
                self.ack_timeout
            ))
        })
    }

    /// Shorthand for `send(ConnectorCommand::Stop)`.
    pub async fn stop(&self) -> AckResult {
        self.send(ConnectorCommand::Stop).await
    }

    /// Shorthand for `send(ConnectorCommand::Start)`.
    pub async fn start(&self) -> AckResult {
        self.send(ConnectorCommand::Start).await
    }

    /// Shorthand for `send(ConnectorCommand::Restart)`.
    pub async fn restart(&self) -> AckResult {
        self.send(ConnectorCommand::Restart).await
    }
}

fn ack(request: UpstreamRequest, result: AckResult) {
    log::info!("Connector command {:?} -> {:?}", request.command, result);
    let _ = request.responder.send(result);
}

/// Acts on a command that arrived while a session is live. Returns how the
/// session ends, or `None` when it carries on.
fn on_session_command(request: UpstreamRequest) -> Option<SessionEnd> {
    match request.command {
        ConnectorCommand::Stop => {
            ack(request, Ok(CommandAck::Applied));
            Some(SessionEnd::Stopped)
        }
        ConnectorCommand::Restart => {
            ack(request, Ok(CommandAck::Applied));
            Some(SessionEnd::Restart)
        }
        ConnectorCommand::Start => {
            ack(request, Ok(CommandAck::AlreadyConnected));
            None
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Shutdown requested or the buffer closed.
    Cancelled,
    /// `Stop` command.
    Stopped,
    /// `Restart` command.
    Restart,
    /// I/O error, close frame, heartbeat timeout or too many protocol errors.
    Failed(String),
}

/// What happened to one inbound frame.
enum FrameOutcome {
    Ingested,
    Control,
    Rejected,
    Malformed(ProtocolError),
    Cancelled,
    /// A command ended the session while the frame waited for buffer space.
    Interrupted(SessionEnd),
}

/// What to do once a backoff wait is over.
enum AfterWait {
    Connect,
    Disabled,
    Cancelled,
}

/// # Upstream Connector
///
/// Cheap to clone: all state lives behind `Arc`s, so the coordinator can start a
/// fresh incarnation after a crash with the same buffer, sequence generator and
/// command channel.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    config: Arc<UpstreamConfig>,
    backoff: BackoffPolicy,
    buffer: Arc<DeliveryBuffer>,
    sequences: Arc<SequenceGenerator>,
    health: PipelineHealth,
    commands: ConnectorCommands,
}

impl UpstreamConnector {
    /// Creates a connector. Nothing happens until `run` is awaited.
    pub fn new(
        config: UpstreamConfig,
        backoff: BackoffPolicy,
        buffer: Arc<DeliveryBuffer>,
        sequences: Arc<SequenceGenerator>,
        health: PipelineHealth,
        commands: ConnectorCommands,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backoff,
            buffer,
            sequences,
            health,
            commands,
        }
    }

    /// # Run
    ///
    /// Connects, receives and reconnects until `cancel` fires. Returns an error only
    /// when `max_connect_attempts` consecutive connects have failed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), FatalPipelineError> {
        let mut commands = self.commands.rx.lock().await;
        let mut enabled = true;
        let mut failures: u32 = 0;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            if !enabled {
                self.health.set_connection(ConnectionState::Disconnected);
                if !self.wait_while_stopped(&mut commands, &cancel).await {
                    break Ok(());
                }
                enabled = true;
                failures = 0;
                continue;
            }

            self.health.set_connection(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                attempt = timeout(self.config.connect_timeout, self.connect()) => attempt,
            };
            let attempt = attempt.unwrap_or_else(|_| {
                Err(ConnectError::new(format!(
                    "timed out after {:?}",
                    self.config.connect_timeout
                )))
            });

            let delay = match attempt {
                Ok(ws) => {
                    failures = 0;
                    self.health.set_connection(ConnectionState::Connected);
                    log::info!("Upstream session established with {}", self.config.uri);

                    match self.run_session(ws, &mut commands, &cancel).await {
                        SessionEnd::Cancelled => break Ok(()),
                        SessionEnd::Stopped => {
                            enabled = false;
                            continue;
                        }
                        SessionEnd::Restart => continue,
                        SessionEnd::Failed(reason) => {
                            self.health.set_connection(ConnectionState::Failed);
                            let delay = self.backoff.delay(0);
                            log::warn!("Upstream session failed: {reason}. Reconnecting in {delay:?}");
                            delay
                        }
                    }
                }
                Err(error) => {
                    failures += 1;
                    self.health.set_connection(ConnectionState::Failed);
                    if let Some(max) = self.config.max_connect_attempts {
                        if failures >= max {
                            log::error!("Giving up on upstream after {failures} failed connects: {error}");
                            break Err(FatalPipelineError::ConnectRetriesExhausted {
                                attempts: failures,
                                last: error,
                            });
                        }
                    }
                    let delay = self.backoff.delay(failures - 1);
                    log::warn!("{error} (attempt {failures}). Retrying in {delay:?}");
                    delay
                }
            };

            match self.wait_before_reconnect(delay, &mut commands, &cancel).await {
                AfterWait::Connect => {}
                AfterWait::Disabled => enabled = false,
                AfterWait::Cancelled => break Ok(()),
            }
        };

        self.health.set_connection(ConnectionState::Disconnected);
        result
    }

    /// Waits for `Start`/`Restart`. Returns `false` on cancellation.
    async fn wait_while_stopped(
        &self,
        commands: &mut mpsc::Receiver<UpstreamRequest>,
        cancel: &CancellationToken,
    ) -> bool {
        log::info!("Upstream connector stopped, waiting for a start command");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                request = commands.recv() => match request {
                    Some(request) => match request.command {
                        ConnectorCommand::Start | ConnectorCommand::Restart => {
                            ack(request, Ok(CommandAck::Applied));
                            return true;
                        }
                        ConnectorCommand::Stop => ack(request, Ok(CommandAck::Applied)),
                    },
                    None => {
                        cancel.cancelled().await;
                        return false;
                    }
                },
            }
        }
    }

    async fn wait_before_reconnect(
        &self,
        delay: Duration,
        commands: &mut mpsc::Receiver<UpstreamRequest>,
        cancel: &CancellationToken,
    ) -> AfterWait {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return AfterWait::Cancelled,
                _ = sleep_until(deadline) => return AfterWait::Connect,
                Some(request) = commands.recv() => match request.command {
                    ConnectorCommand::Stop => {
                        ack(request, Ok(CommandAck::Applied));
                        return AfterWait::Disabled;
                    }
                    ConnectorCommand::Start | ConnectorCommand::Restart => {
                        ack(request, Ok(CommandAck::Applied));
                        return AfterWait::Connect;
                    }
                },
            }
        }
    }

    /// # Connect
    ///
    /// Resolves the endpoint (token bootstrap), performs the handshake, then sends
    /// the authentication and subscription frames.
    async fn connect(&self) -> Result<WsStream, ConnectError> {
        let uri = self.resolve_endpoint().await?;
        log::info!("Connecting to upstream {}", redact(&uri));

        let mut request = uri
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::new(format!("invalid handshake request: {e}")))?;
        for (name, value) in &self.config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConnectError::new(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConnectError::new(format!("invalid value for header '{name}': {e}")))?;
            request.headers_mut().insert(header, value);
        }

        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| ConnectError::new(format!("handshake with {} failed: {e}", redact(&uri))))?;

        if !self.config.auth_frames.is_empty() {
            self.health.set_connection(ConnectionState::Authenticating);
            for frame in &self.config.auth_frames {
                ws.send(WsMessage::text(frame.to_string()))
                    .await
                    .map_err(|e| ConnectError::new(format!("authentication frame failed: {e}")))?;
            }
        }

        for frame in &self.config.subscribe_frames {
            log::debug!("Subscribing upstream: {frame}");
            ws.send(WsMessage::text(frame.to_string()))
                .await
                .map_err(|e| ConnectError::new(format!("subscribe frame failed: {e}")))?;
        }

        Ok(ws)
    }

    /// Fetches a connection token when a bootstrap endpoint is configured and
    /// returns the websocket URI to dial.
    async fn resolve_endpoint(&self) -> Result<Url, ConnectError> {
        let Some(bootstrap) = &self.config.token else {
            return Ok(self.config.uri.clone());
        };

        let client = ApiClient::with_options(
            bootstrap.url.as_str(),
            None,
            bootstrap.retries,
            Some(self.config.connect_timeout),
        )
        .map_err(|e| ConnectError::new(format!("token client: {e:#}")))?;

        let response: ApiResponse<Value> = client
            .request(Method::POST, "", None, None::<()>)
            .await
            .map_err(|e| ConnectError::new(format!("token request to {} failed: {e:#}", bootstrap.url)))?;
        if !response.success {
            return Err(ConnectError::new(format!(
                "token endpoint answered HTTP {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            )));
        }
        let body = response.data.unwrap_or(Value::Null);

        let token = body
            .pointer(&bootstrap.token_pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConnectError::new(format!("no token at '{}' in the token response", bootstrap.token_pointer))
            })?;

        let mut uri = match bootstrap.endpoint_pointer.as_deref() {
            Some(pointer) => match body.pointer(pointer).and_then(Value::as_str) {
                Some(endpoint) => Url::parse(endpoint)
                    .map_err(|e| ConnectError::new(format!("bad endpoint '{endpoint}' in token response: {e}")))?,
                None => {
                    log::warn!("No endpoint at '{pointer}' in the token response, using {}", self.config.uri);
                    self.config.uri.clone()
                }
            },
            None => self.config.uri.clone(),
        };
        uri.query_pairs_mut().append_pair(&bootstrap.query_param, token);
        Ok(uri)
    }

    /// # Session Loop
    ///
    /// Receives frames until the session ends. Heartbeats go out every
    /// `interval`; silence longer than `timeout` fails the session.
    async fn run_session(
        &self,
        ws: WsStream,
        commands: &mut mpsc::Receiver<UpstreamRequest>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read): (WsWrite, WsRead) = ws.split();
        let heartbeat = &self.config.heartbeat;
        let mut ticker = interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_seen = Instant::now();
        let mut protocol_errors: u32 = 0;

        let end = loop {
            let silence_deadline = last_seen + heartbeat.timeout;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                Some(request) = commands.recv() => {
                    if let Some(end) = on_session_command(request) {
                        break end;
                    }
                }
                _ = sleep_until(silence_deadline) => {
                    break SessionEnd::Failed(format!("no upstream traffic for {:?}", heartbeat.timeout));
                }
                _ = ticker.tick() => {
                    let beat = match &heartbeat.payload {
                        Some(payload) => WsMessage::text(payload.clone()),
                        None => WsMessage::Ping(Bytes::new()),
                    };
                    log::trace!("Sending heartbeat");
                    if let Err(e) = write.send(beat).await {
                        break SessionEnd::Failed(format!("heartbeat send failed: {e}"));
                    }
                }
                frame = read.next() => {
                    let message = match frame {
                        None => break SessionEnd::Failed("upstream ended the stream".to_string()),
                        Some(Err(e)) => break SessionEnd::Failed(format!("read failed: {e}")),
                        Some(Ok(message)) => message,
                    };
                    last_seen = Instant::now();

                    let payload = match message {
                        WsMessage::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                        WsMessage::Binary(data) => data,
                        WsMessage::Ping(data) => {
                            if let Err(e) = write.send(WsMessage::Pong(data)).await {
                                break SessionEnd::Failed(format!("pong send failed: {e}"));
                            }
                            continue;
                        }
                        WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                        WsMessage::Close(frame) => {
                            let reason = frame.map(|f| format!("{} {}", f.code, f.reason)).unwrap_or_default();
                            break SessionEnd::Failed(format!("upstream closed the session {reason}").trim_end().to_string());
                        }
                    };

                    match self.on_message(payload, commands, cancel).await {
                        FrameOutcome::Ingested | FrameOutcome::Control | FrameOutcome::Rejected => {
                            protocol_errors = 0;
                        }
                        FrameOutcome::Malformed(error) => {
                            protocol_errors += 1;
                            log::warn!("Dropping upstream frame: {error} ({protocol_errors} in a row)");
                            if protocol_errors >= self.config.max_consecutive_protocol_errors {
                                break SessionEnd::Failed(format!("{protocol_errors} malformed frames in a row"));
                            }
                        }
                        FrameOutcome::Cancelled => break SessionEnd::Cancelled,
                        FrameOutcome::Interrupted(end) => break end,
                    }
                    // A blocked push is our own backpressure, not upstream silence.
                    last_seen = Instant::now();
                }
            }
        };

        if matches!(end, SessionEnd::Cancelled | SessionEnd::Stopped) {
            self.health.set_connection(ConnectionState::Draining);
        }
        let close_grace = self.config.connect_timeout.min(Duration::from_secs(1));
        if timeout(close_grace, write.close()).await.is_err() {
            log::debug!("Upstream close handshake timed out");
        }
        end
    }

    /// # On Message
    ///
    /// Validates one frame, assigns its sequence number and pushes it into the
    /// buffer. Malformed frames never consume a sequence number.
    ///
    /// Commands are still served while a full buffer holds the push back. `Stop`
    /// and `Restart` abandon the waiting frame, leaving a gap in the sequence.
    async fn on_message(
        &self,
        payload: Bytes,
        commands: &mut mpsc::Receiver<UpstreamRequest>,
        cancel: &CancellationToken,
    ) -> FrameOutcome {
        let value: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(e) => return FrameOutcome::Malformed(ProtocolError::new(format!("not JSON: {e}"))),
        };

        if let Some(kind) = value.get("type").and_then(Value::as_str) {
            if self.config.control_frame_types.iter().any(|t| t == kind) {
                log::debug!("Upstream control frame: {kind}");
                return FrameOutcome::Control;
            }
        }

        let envelope = MessageEnvelope::new(self.sequences.next_sequence(), payload);
        let sequence = envelope.sequence();
        let push = self.buffer.push(envelope);
        tokio::pin!(push);
        let pushed = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return FrameOutcome::Cancelled,
                pushed = &mut push => break pushed,
                Some(request) = commands.recv() => {
                    if let Some(end) = on_session_command(request) {
                        log::warn!("Upstream message {sequence} abandoned while waiting for buffer space");
                        return FrameOutcome::Interrupted(end);
                    }
                }
            }
        };

        match pushed {
            Ok(PushOutcome::Accepted) | Ok(PushOutcome::Evicted { .. }) => {
                log::trace!("Buffered upstream message {sequence}");
                FrameOutcome::Ingested
            }
            Err(BufferError::Overflow { .. }) => FrameOutcome::Rejected,
            Err(BufferError::Closed) => {
                log::info!("Delivery buffer closed, upstream message {sequence} not admitted");
                FrameOutcome::Cancelled
            }
            Err(error @ BufferError::OutOfOrder { .. }) => {
                log::error!("Upstream message dropped: {error}");
                FrameOutcome::Rejected
            }
        }
    }
}

/// Strips query values (tokens) from a URI before logging it.
fn redact(uri: &Url) -> String {
    let mut shown = uri.clone();
    if shown.query().is_some() {
        shown.set_query(Some("redacted"));
    }
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{HeartbeatConfig, TokenBootstrap};
    use crate::core::buffer::OverflowPolicy;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use tokio::time::sleep;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::{accept_async, accept_hdr_async};

    type ServerWs = WebSocketStream<TcpStream>;

    async fn upstream() -> (Url, mpsc::UnboundedReceiver<ServerWs>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    let _ = tx.send(ws);
                }
            }
        });
        (Url::parse(&format!("ws://{addr}/feed")).unwrap(), rx)
    }

    fn config(uri: Url) -> UpstreamConfig {
        UpstreamConfig {
            uri,
            headers: BTreeMap::new(),
            token: None,
            auth_frames: Vec::new(),
            subscribe_frames: Vec::new(),
            control_frame_types: vec!["welcome".to_string()],
            connect_timeout: Duration::from_secs(2),
            max_connect_attempts: None,
            max_consecutive_protocol_errors: 3,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(5),
                timeout: Duration::from_secs(10),
                payload: None,
            },
        }
    }

    struct Harness {
        buffer: Arc<DeliveryBuffer>,
        health: PipelineHealth,
        control: ConnectorControl,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<(), FatalPipelineError>>,
    }

    fn start(config: UpstreamConfig, capacity: usize) -> Harness {
        let buffer = Arc::new(DeliveryBuffer::new(capacity, OverflowPolicy::Block));
        let health = PipelineHealth::new();
        let (control, commands) = ConnectorControl::channel(4);
        let connector = UpstreamConnector::new(
            config,
            BackoffPolicy::fixed(Duration::from_millis(20)),
            Arc::clone(&buffer),
            Arc::new(SequenceGenerator::new()),
            health.clone(),
            commands,
        );
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.run(cancel).await })
        };
        Harness {
            buffer,
            health,
            control,
            cancel,
            task,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn payloads(buffer: &DeliveryBuffer) -> Vec<String> {
        buffer
            .peek_batch(usize::MAX, usize::MAX)
            .map(|b| {
                b.envelopes()
                    .iter()
                    .map(|e| String::from_utf8(e.payload().to_vec()).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn ingests_frames_in_order_and_skips_noise() {
        let (uri, mut conns) = upstream().await;
        let mut cfg = config(uri);
        cfg.subscribe_frames = vec![serde_json::json!({"type": "subscribe", "topic": "ticker"})];
        let h = start(cfg, 100);

        let mut ws = conns.recv().await.unwrap();
        let subscribe = ws.next().await.unwrap().unwrap();
        let subscribe: Value = serde_json::from_str(subscribe.to_text().unwrap()).unwrap();
        assert_eq!(subscribe, serde_json::json!({"type": "subscribe", "topic": "ticker"}));

        ws.send(WsMessage::text(r#"{"type":"welcome"}"#)).await.unwrap();
        ws.send(WsMessage::text(r#"{"n":1}"#)).await.unwrap();
        ws.send(WsMessage::text("not json")).await.unwrap();
        ws.send(WsMessage::Binary(Bytes::from_static(br#"{"n":2}"#))).await.unwrap();
        ws.send(WsMessage::text(r#"{"n":3}"#)).await.unwrap();

        eventually(|| h.buffer.len() == 3).await;
        assert_eq!(payloads(&h.buffer), vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
        assert_eq!(h.buffer.pending_sequences(), vec![1, 2, 3]);
        assert_eq!(h.health.snapshot().connection, ConnectionState::Connected);

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
        assert_eq!(h.health.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_and_keeps_numbering() {
        let (uri, mut conns) = upstream().await;
        let h = start(config(uri), 100);

        let mut first = conns.recv().await.unwrap();
        first.send(WsMessage::text(r#"{"n":1}"#)).await.unwrap();
        first.send(WsMessage::text(r#"{"n":2}"#)).await.unwrap();
        eventually(|| h.buffer.len() == 2).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = conns.recv().await.unwrap();
        second.send(WsMessage::text(r#"{"n":3}"#)).await.unwrap();
        eventually(|| h.buffer.len() == 3).await;

        assert_eq!(h.buffer.pending_sequences(), vec![1, 2, 3]);
        assert_eq!(h.health.snapshot().sessions, 2);
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn answers_pings_and_recycles_silent_sessions() {
        let (uri, mut conns) = upstream().await;
        let mut cfg = config(uri);
        cfg.heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
            payload: None,
        };
        let h = start(cfg, 100);

        let mut ws = conns.recv().await.unwrap();
        ws.send(WsMessage::Ping(Bytes::from_static(b"hi"))).await.unwrap();
        let mut saw_pong = false;
        let mut saw_ping = false;
        while !(saw_pong && saw_ping) {
            match ws.next().await {
                Some(Ok(WsMessage::Pong(data))) => saw_pong = data == Bytes::from_static(b"hi"),
                Some(Ok(WsMessage::Ping(_))) => saw_ping = true,
                Some(Ok(_)) => {}
                _ => panic!("session ended before heartbeats were exchanged"),
            }
        }

        // Stop reading and stay silent: the connector must give up and dial again.
        let replacement = timeout(Duration::from_secs(3), conns.recv()).await.unwrap();
        assert!(replacement.is_some());
        drop(ws);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn repeated_malformed_frames_recycle_the_session() {
        let (uri, mut conns) = upstream().await;
        let h = start(config(uri), 100);

        let mut ws = conns.recv().await.unwrap();
        for _ in 0..3 {
            ws.send(WsMessage::text("{broken")).await.unwrap();
        }
        let replacement = timeout(Duration::from_secs(3), conns.recv()).await.unwrap();
        assert!(replacement.is_some());
        assert!(h.buffer.is_empty());

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_connect_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = config(Url::parse(&format!("ws://{addr}/feed")).unwrap());
        cfg.max_connect_attempts = Some(3);
        let h = start(cfg, 10);

        let result = timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
        match result {
            Err(FatalPipelineError::ConnectRetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted connect retries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_start_and_restart_commands() {
        let (uri, mut conns) = upstream().await;
        let h = start(config(uri), 100);
        let _first = conns.recv().await.unwrap();
        eventually(|| h.health.snapshot().connection == ConnectionState::Connected).await;

        h.control.stop().await.unwrap();
        eventually(|| h.health.snapshot().connection == ConnectionState::Disconnected).await;
        assert!(timeout(Duration::from_millis(200), conns.recv()).await.is_err());

        h.control.start().await.unwrap();
        let _second = timeout(Duration::from_secs(2), conns.recv()).await.unwrap().unwrap();

        h.control.restart().await.unwrap();
        let _third = timeout(Duration::from_secs(2), conns.recv()).await.unwrap().unwrap();
        eventually(|| h.health.snapshot().sessions == 3).await;

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert!(h.control.stop().await.is_err());
    }

    #[tokio::test]
    async fn blocked_push_is_released_by_cancellation() {
        let (uri, mut conns) = upstream().await;
        let h = start(config(uri), 1);

        let mut ws = conns.recv().await.unwrap();
        ws.send(WsMessage::text(r#"{"n":1}"#)).await.unwrap();
        ws.send(WsMessage::text(r#"{"n":2}"#)).await.unwrap();
        eventually(|| h.buffer.len() == 1).await;

        h.cancel.cancel();
        timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(h.buffer.pending_sequences(), vec![1]);
    }

    #[tokio::test]
    async fn commands_are_served_while_a_push_waits_for_space() {
        let (uri, mut conns) = upstream().await;
        let h = start(config(uri), 1);

        let mut ws = conns.recv().await.unwrap();
        ws.send(WsMessage::text(r#"{"n":1}"#)).await.unwrap();
        ws.send(WsMessage::text(r#"{"n":2}"#)).await.unwrap();
        eventually(|| h.buffer.len() == 1).await;
        sleep(Duration::from_millis(100)).await;

        let start = timeout(Duration::from_secs(3), h.control.start()).await;
        assert_eq!(start.unwrap(), Ok(CommandAck::AlreadyConnected));
        let stop = timeout(Duration::from_secs(3), h.control.stop()).await;
        assert_eq!(stop.unwrap(), Ok(CommandAck::Applied));
        eventually(|| h.health.snapshot().connection == ConnectionState::Disconnected).await;
        assert_eq!(payloads(&h.buffer), vec![r#"{"n":1}"#]);

        h.control.start().await.unwrap();
        let mut second = timeout(Duration::from_secs(2), conns.recv()).await.unwrap().unwrap();
        h.buffer.acknowledge(1);
        second.send(WsMessage::text(r#"{"n":3}"#)).await.unwrap();
        second.send(WsMessage::text(r#"{"n":4}"#)).await.unwrap();
        eventually(|| payloads(&h.buffer) == vec![r#"{"n":3}"#.to_string()]).await;
        sleep(Duration::from_millis(100)).await;

        let restart = timeout(Duration::from_secs(3), h.control.restart()).await;
        assert_eq!(restart.unwrap(), Ok(CommandAck::Applied));
        let _third = timeout(Duration::from_secs(2), conns.recv()).await.unwrap().unwrap();
        assert_eq!(payloads(&h.buffer), vec![r#"{"n":3}"#]);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unanswered_commands_time_out() {
        let (control, _commands) = ConnectorControl::channel(1);
        let control = control.with_ack_timeout(Duration::from_millis(50));

        let result = timeout(Duration::from_secs(2), control.stop()).await.unwrap();
        let error = result.unwrap_err();
        assert!(error.contains("did not acknowledge"), "{error}");
    }

    #[tokio::test]
    async fn sends_auth_frames_before_subscribing() {
        let (uri, mut conns) = upstream().await;
        let mut cfg = config(uri);
        cfg.auth_frames = vec![
            serde_json::json!({"type": "auth", "key": "k-1"}),
            serde_json::json!({"type": "auth", "signature": "s-1"}),
        ];
        cfg.subscribe_frames = vec![serde_json::json!({"type": "subscribe", "topic": "ticker"})];
        let h = start(cfg, 10);

        let mut ws = conns.recv().await.unwrap();
        let mut received = Vec::new();
        while received.len() < 3 {
            if let WsMessage::Text(text) = ws.next().await.unwrap().unwrap() {
                received.push(serde_json::from_str::<Value>(text.as_str()).unwrap());
            }
        }
        assert_eq!(received[0]["key"], "k-1");
        assert_eq!(received[1]["signature"], "s-1");
        assert_eq!(received[2]["type"], "subscribe");
        eventually(|| h.health.snapshot().connection == ConnectionState::Connected).await;

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stays_authenticating_until_credentials_are_written() {
        let (uri, mut conns) = upstream().await;
        let mut cfg = config(uri);
        cfg.connect_timeout = Duration::from_secs(30);
        // Larger than the loopback socket buffers, so the write stalls while the
        // server is not reading.
        cfg.auth_frames = vec![Value::String("x".repeat(32 * 1024 * 1024))];
        let h = start(cfg, 10);

        let ws = conns.recv().await.unwrap();
        eventually(|| h.health.snapshot().connection == ConnectionState::Authenticating).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.health.snapshot().connection, ConnectionState::Authenticating);
        assert_eq!(h.health.snapshot().sessions, 0);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        drop(ws);
    }

    #[tokio::test]
    async fn sends_text_heartbeats_when_a_payload_is_configured() {
        let (uri, mut conns) = upstream().await;
        let mut cfg = config(uri);
        cfg.heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            payload: Some(r#"{"type":"ping"}"#.to_string()),
        };
        let h = start(cfg, 10);

        let mut ws = conns.recv().await.unwrap();
        timeout(Duration::from_secs(3), async {
            let mut beats = 0;
            while beats < 2 {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        assert_eq!(text.as_str(), r#"{"type":"ping"}"#);
                        beats += 1;
                    }
                    Some(Ok(WsMessage::Ping(_))) => panic!("websocket ping sent despite a text heartbeat"),
                    Some(Ok(_)) => {}
                    _ => panic!("session ended before any heartbeat"),
                }
            }
        })
        .await
        .unwrap();

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bootstraps_a_token_before_dialing() {
        use axum::routing::post;
        use axum::{Json, Router};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();
        let seen_uri = Arc::new(StdMutex::new(None::<String>));
        {
            let seen_uri = Arc::clone(&seen_uri);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let seen_uri = Arc::clone(&seen_uri);
                    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        *seen_uri.lock().unwrap() = Some(request.uri().to_string());
                        Ok(response)
                    };
                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        tokio::spawn(async move {
                            let (_write, mut read) = ws.split();
                            while read.next().await.is_some() {}
                        });
                    }
                }
            });
        }

        let endpoint = format!("ws://{ws_addr}/endpoint");
        let app = Router::new().route(
            "/bullet-public",
            post(move || {
                let endpoint = endpoint.clone();
                async move {
                    Json(serde_json::json!({
                        "code": "200000",
                        "data": { "token": "tok-123", "instanceServers": [{ "endpoint": endpoint }] }
                    }))
                }
            }),
        );
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(http, app).await.unwrap();
        });

        let mut cfg = config(Url::parse("ws://127.0.0.1:9/unused").unwrap());
        cfg.token = Some(TokenBootstrap {
            url: Url::parse(&format!("http://{http_addr}/bullet-public")).unwrap(),
            token_pointer: "/data/token".to_string(),
            endpoint_pointer: Some("/data/instanceServers/0/endpoint".to_string()),
            query_param: "token".to_string(),
            retries: 0,
        });
        let h = start(cfg, 10);

        eventually(|| h.health.snapshot().connection == ConnectionState::Connected).await;
        assert_eq!(seen_uri.lock().unwrap().as_deref(), Some("/endpoint?token=tok-123"));

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[test]
    fn redacts_tokens() {
        let uri = Url::parse("wss://feed.example.com/ws?token=secret").unwrap();
        assert!(!redact(&uri).contains("secret"));
    }
}
