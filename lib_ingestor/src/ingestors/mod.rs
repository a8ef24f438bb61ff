//! # Ingestors
//!
//! Upstream sources that turn inbound traffic into `MessageEnvelope`s pushed into
//! the shared `DeliveryBuffer`.
//!
//! ## Contained Modules:
//!
//! - **`upstream_ws`**: the websocket connector. It owns the session lifecycle
//!   (token bootstrap, handshake, authentication frames, subscriptions), the
//!   receive loop with heartbeat supervision, and reconnects with backoff. It can
//!   be stopped, started and restarted at runtime through a `ConnectorControl`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Websocket upstream connector.
pub mod upstream_ws;

// --- Public API Re-exports ---
pub use upstream_ws::{AckResult, CommandAck, ConnectorCommand, ConnectorCommands, ConnectorControl, UpstreamConnector, UpstreamRequest};
