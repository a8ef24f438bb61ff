//! # Ingestor Configuration
//!
//! `IngestorSettings` is the flat, camelCase, all-optional shape used by config
//! files, environment variables and CLI flags. Layers are combined with `merge`,
//! where the later layer wins for every field it sets. `into_config` validates
//! the result and produces the strongly typed `IngestorConfig`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::core::backoff::BackoffPolicy;
use crate::core::buffer::OverflowPolicy;

/// Problems found while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for `IngestorSettings`.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A required option is absent.
    #[error("missing required option '{0}'")]
    Missing(&'static str),
    /// An option holds an unusable value.
    #[error("invalid value for '{key}': {reason}")]
    Invalid {
        /// Option name.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(key: &'static str, reason: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// What the forwarder does with a batch it can never deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FatalDeliveryPolicy {
    /// Stop forwarding and fail the pipeline. Nothing is lost silently.
    Halt,
    /// Log, acknowledge the batch anyway and carry on, accepting the loss.
    Drop,
}

impl FromStr for FatalDeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown fatal delivery policy '{other}' (expected halt or drop)")),
        }
    }
}

impl fmt::Display for FatalDeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halt => f.write_str("halt"),
            Self::Drop => f.write_str("drop"),
        }
    }
}

/// # Ingestor Settings
///
/// One configuration layer. Every field is optional so that layers can be merged;
/// `into_config` enforces what is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestorSettings {
    // --- Upstream ---
    /// Websocket endpoint (`ws://` or `wss://`).
    pub upstream_uri: Option<String>,
    /// Extra handshake headers.
    pub upstream_headers: Option<BTreeMap<String, String>>,
    /// Token bootstrap endpoint, POSTed before every handshake.
    pub token_url: Option<String>,
    /// JSON pointer of the token inside the bootstrap response.
    pub token_pointer: Option<String>,
    /// JSON pointer of a replacement websocket endpoint inside the bootstrap response.
    pub endpoint_pointer: Option<String>,
    /// Query parameter carrying the token.
    pub token_query_param: Option<String>,
    /// Middleware retries for the bootstrap request.
    pub token_fetch_retries: Option<u32>,
    /// Frames sent while authenticating.
    pub auth_frames: Option<Vec<Value>>,
    /// Frames sent once authenticated.
    pub subscribe_frames: Option<Vec<Value>>,
    /// `"type"` values that mark protocol control frames.
    pub control_frame_types: Option<Vec<String>>,
    /// Bound on token fetch plus handshake.
    pub connect_timeout_ms: Option<u64>,
    /// Consecutive failed connects before giving up; 0 means unbounded.
    pub max_connect_attempts: Option<u32>,
    /// Malformed frames in a row before the session is recycled.
    pub max_consecutive_protocol_errors: Option<u32>,
    /// Heartbeat period.
    pub heartbeat_interval_ms: Option<u64>,
    /// Upstream silence tolerated before reconnecting.
    pub heartbeat_timeout_ms: Option<u64>,
    /// Text frame sent as heartbeat instead of a websocket Ping.
    pub heartbeat_payload: Option<String>,

    // --- Downstream ---
    /// HTTP sink endpoint.
    pub downstream_uri: Option<String>,
    /// HTTP method used for delivery.
    pub downstream_method: Option<String>,
    /// Extra request headers.
    pub downstream_headers: Option<BTreeMap<String, String>>,
    /// Bearer token for the sink.
    pub downstream_bearer_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout_ms: Option<u64>,

    // --- Buffer & batching ---
    /// Buffer capacity in envelopes.
    pub buffer_capacity: Option<usize>,
    /// `block`, `drop-oldest` or `reject`.
    pub overflow_policy: Option<String>,
    /// Envelopes per batch.
    pub max_batch_count: Option<usize>,
    /// Payload bytes per batch.
    pub max_batch_bytes: Option<usize>,
    /// Flush deadline measured from the oldest pending envelope.
    pub batch_timeout_ms: Option<u64>,

    // --- Retry & backoff ---
    /// Retries after the first delivery attempt of a batch.
    pub max_retry_attempts: Option<u32>,
    /// `halt` or `drop`.
    pub fatal_delivery_policy: Option<String>,
    /// First backoff delay.
    pub backoff_base_ms: Option<u64>,
    /// Growth factor per attempt.
    pub backoff_multiplier: Option<f64>,
    /// Largest backoff delay.
    pub backoff_cap_ms: Option<u64>,
    /// Jitter as a fraction of the raw delay.
    pub backoff_jitter: Option<f64>,
    /// Seed for reproducible jitter.
    pub backoff_seed: Option<u64>,

    // --- Lifecycle ---
    /// Bound on draining during graceful shutdown.
    pub shutdown_timeout_ms: Option<u64>,
    /// Crash restarts allowed per unit.
    pub max_unit_restarts: Option<u32>,
}

impl IngestorSettings {
    /// The built-in defaults layer. Upstream and downstream URIs have no default.
    pub fn defaults() -> Self {
        Self {
            token_pointer: Some("/data/token".to_string()),
            token_query_param: Some("token".to_string()),
            token_fetch_retries: Some(3),
            connect_timeout_ms: Some(10_000),
            max_connect_attempts: Some(0),
            max_consecutive_protocol_errors: Some(10),
            heartbeat_interval_ms: Some(15_000),
            heartbeat_timeout_ms: Some(45_000),
            downstream_method: Some("POST".to_string()),
            request_timeout_ms: Some(10_000),
            buffer_capacity: Some(10_000),
            overflow_policy: Some("block".to_string()),
            max_batch_count: Some(100),
            max_batch_bytes: Some(1_048_576),
            batch_timeout_ms: Some(1_000),
            max_retry_attempts: Some(5),
            fatal_delivery_policy: Some("halt".to_string()),
            backoff_base_ms: Some(500),
            backoff_multiplier: Some(2.0),
            backoff_cap_ms: Some(30_000),
            backoff_jitter: Some(0.2),
            shutdown_timeout_ms: Some(10_000),
            max_unit_restarts: Some(5),
            ..Default::default()
        }
    }

    /// Reads one layer from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merges two layers; `other` overrides `self` wherever it is `Some`.
    pub fn merge(self, other: IngestorSettings) -> IngestorSettings {
        IngestorSettings {
            upstream_uri: other.upstream_uri.or(self.upstream_uri),
            upstream_headers: other.upstream_headers.or(self.upstream_headers),
            token_url: other.token_url.or(self.token_url),
            token_pointer: other.token_pointer.or(self.token_pointer),
            endpoint_pointer: other.endpoint_pointer.or(self.endpoint_pointer),
            token_query_param: other.token_query_param.or(self.token_query_param),
            token_fetch_retries: other.token_fetch_retries.or(self.token_fetch_retries),
            auth_frames: other.auth_frames.or(self.auth_frames),
            subscribe_frames: other.subscribe_frames.or(self.subscribe_frames),
            control_frame_types: other.control_frame_types.or(self.control_frame_types),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            max_connect_attempts: other.max_connect_attempts.or(self.max_connect_attempts),
            max_consecutive_protocol_errors: other
                .max_consecutive_protocol_errors
                .or(self.max_consecutive_protocol_errors),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            heartbeat_timeout_ms: other.heartbeat_timeout_ms.or(self.heartbeat_timeout_ms),
            heartbeat_payload: other.heartbeat_payload.or(self.heartbeat_payload),
            downstream_uri: other.downstream_uri.or(self.downstream_uri),
            downstream_method: other.downstream_method.or(self.downstream_method),
            downstream_headers: other.downstream_headers.or(self.downstream_headers),
            downstream_bearer_token: other.downstream_bearer_token.or(self.downstream_bearer_token),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            buffer_capacity: other.buffer_capacity.or(self.buffer_capacity),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
            max_batch_count: other.max_batch_count.or(self.max_batch_count),
            max_batch_bytes: other.max_batch_bytes.or(self.max_batch_bytes),
            batch_timeout_ms: other.batch_timeout_ms.or(self.batch_timeout_ms),
            max_retry_attempts: other.max_retry_attempts.or(self.max_retry_attempts),
            fatal_delivery_policy: other.fatal_delivery_policy.or(self.fatal_delivery_policy),
            backoff_base_ms: other.backoff_base_ms.or(self.backoff_base_ms),
            backoff_multiplier: other.backoff_multiplier.or(self.backoff_multiplier),
            backoff_cap_ms: other.backoff_cap_ms.or(self.backoff_cap_ms),
            backoff_jitter: other.backoff_jitter.or(self.backoff_jitter),
            backoff_seed: other.backoff_seed.or(self.backoff_seed),
            shutdown_timeout_ms: other.shutdown_timeout_ms.or(self.shutdown_timeout_ms),
            max_unit_restarts: other.max_unit_restarts.or(self.max_unit_restarts),
        }
    }

    /// # Validate
    ///
    /// Checks every option and builds the immutable `IngestorConfig`. Defaults are
    /// filled in for anything left unset, so a layer does not have to be merged
    /// over `defaults()` first.
    pub fn into_config(self) -> Result<IngestorConfig, ConfigError> {
        let s = IngestorSettings::defaults().merge(self);

        // --- Upstream ---
        let upstream_uri = parse_url(
            "upstreamUri",
            s.upstream_uri.as_deref().ok_or(ConfigError::Missing("upstreamUri"))?,
            &["ws", "wss"],
        )?;

        let token = match s.token_url.as_deref() {
            Some(raw) => {
                let token_pointer = s.token_pointer.clone().unwrap_or_default();
                check_pointer("tokenPointer", &token_pointer)?;
                if let Some(pointer) = s.endpoint_pointer.as_deref() {
                    check_pointer("endpointPointer", pointer)?;
                }
                let query_param = s.token_query_param.clone().unwrap_or_default();
                if query_param.is_empty() {
                    return Err(invalid("tokenQueryParam", "must not be empty"));
                }
                Some(TokenBootstrap {
                    url: parse_url("tokenUrl", raw, &["http", "https"])?,
                    token_pointer,
                    endpoint_pointer: s.endpoint_pointer.clone(),
                    query_param,
                    retries: s.token_fetch_retries.unwrap_or(0),
                })
            }
            None => None,
        };

        let heartbeat_interval = millis(s.heartbeat_interval_ms);
        let heartbeat_timeout = millis(s.heartbeat_timeout_ms);
        if heartbeat_interval.is_zero() {
            return Err(invalid("heartbeatIntervalMs", "must be greater than 0"));
        }
        if heartbeat_timeout < heartbeat_interval {
            return Err(invalid(
                "heartbeatTimeoutMs",
                format!("{heartbeat_timeout:?} is shorter than the heartbeat interval {heartbeat_interval:?}"),
            ));
        }

        let connect_timeout = millis(s.connect_timeout_ms);
        if connect_timeout.is_zero() {
            return Err(invalid("connectTimeoutMs", "must be greater than 0"));
        }

        let upstream = UpstreamConfig {
            uri: upstream_uri,
            headers: s.upstream_headers.unwrap_or_default(),
            token,
            auth_frames: s.auth_frames.unwrap_or_default(),
            subscribe_frames: s.subscribe_frames.unwrap_or_default(),
            control_frame_types: s.control_frame_types.unwrap_or_default(),
            connect_timeout,
            max_connect_attempts: s.max_connect_attempts.filter(|n| *n > 0),
            max_consecutive_protocol_errors: s.max_consecutive_protocol_errors.unwrap_or(0).max(1),
            heartbeat: HeartbeatConfig {
                interval: heartbeat_interval,
                timeout: heartbeat_timeout,
                payload: s.heartbeat_payload,
            },
        };

        // --- Downstream ---
        let downstream_uri = parse_url(
            "downstreamUri",
            s.downstream_uri.as_deref().ok_or(ConfigError::Missing("downstreamUri"))?,
            &["http", "https"],
        )?;
        let method_raw = s.downstream_method.unwrap_or_default();
        let method = http::Method::from_bytes(method_raw.trim().to_ascii_uppercase().as_bytes())
            .map_err(|e| invalid("downstreamMethod", format!("'{method_raw}': {e}")))?;
        let request_timeout = millis(s.request_timeout_ms);
        if request_timeout.is_zero() {
            return Err(invalid("requestTimeoutMs", "must be greater than 0"));
        }
        let downstream = DownstreamConfig {
            uri: downstream_uri,
            method,
            headers: s.downstream_headers.unwrap_or_default(),
            bearer_token: s.downstream_bearer_token,
            request_timeout,
        };

        // --- Buffer & batching ---
        let capacity = s.buffer_capacity.unwrap_or(0);
        if capacity == 0 {
            return Err(invalid("bufferCapacity", "must be greater than 0"));
        }
        let overflow = s
            .overflow_policy
            .unwrap_or_default()
            .parse::<OverflowPolicy>()
            .map_err(|e| invalid("overflowPolicy", e))?;

        let max_count = s.max_batch_count.unwrap_or(0);
        if max_count == 0 {
            return Err(invalid("maxBatchCount", "must be greater than 0"));
        }
        if max_count > capacity {
            return Err(invalid(
                "maxBatchCount",
                format!("{max_count} exceeds bufferCapacity {capacity}"),
            ));
        }
        let max_bytes = s.max_batch_bytes.unwrap_or(0);
        if max_bytes == 0 {
            return Err(invalid("maxBatchBytes", "must be greater than 0"));
        }

        // --- Retry & backoff ---
        let fatal_policy = s
            .fatal_delivery_policy
            .unwrap_or_default()
            .parse::<FatalDeliveryPolicy>()
            .map_err(|e| invalid("fatalDeliveryPolicy", e))?;

        let multiplier = s.backoff_multiplier.unwrap_or(1.0);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(invalid("backoffMultiplier", format!("{multiplier} must be >= 1")));
        }
        let jitter = s.backoff_jitter.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(invalid("backoffJitter", format!("{jitter} must be within 0..=1")));
        }
        let base = millis(s.backoff_base_ms);
        let cap = millis(s.backoff_cap_ms);
        if base > cap {
            return Err(invalid(
                "backoffBaseMs",
                format!("{base:?} exceeds backoffCapMs {cap:?}"),
            ));
        }

        Ok(IngestorConfig {
            upstream,
            downstream,
            buffer: BufferConfig { capacity, overflow },
            batch: BatchConfig {
                max_count,
                max_bytes,
                timeout: millis(s.batch_timeout_ms),
            },
            retry: RetryConfig {
                max_retry_attempts: s.max_retry_attempts.unwrap_or(0),
                fatal_policy,
            },
            backoff: BackoffConfig {
                base,
                multiplier,
                cap,
                jitter,
                seed: s.backoff_seed,
            },
            shutdown_timeout: millis(s.shutdown_timeout_ms),
            max_unit_restarts: s.max_unit_restarts.unwrap_or(0),
        })
    }
}

fn millis(value: Option<u64>) -> Duration {
    Duration::from_millis(value.unwrap_or(0))
}

fn parse_url(key: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| invalid(key, format!("'{raw}': {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(
            key,
            format!("scheme '{}' not allowed (expected {})", url.scheme(), schemes.join(" or ")),
        ));
    }
    Ok(url)
}

fn check_pointer(key: &'static str, pointer: &str) -> Result<(), ConfigError> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(invalid(key, format!("'{pointer}' is not a JSON pointer")))
    }
}

/// Token bootstrap performed before each websocket handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBootstrap {
    /// Endpoint that issues connection tokens.
    pub url: Url,
    /// JSON pointer of the token in the response.
    pub token_pointer: String,
    /// JSON pointer of a replacement websocket endpoint, if the service hands one out.
    pub endpoint_pointer: Option<String>,
    /// Query parameter the token is appended as.
    pub query_param: String,
    /// Middleware retries for the bootstrap request.
    pub retries: u32,
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Ping period.
    pub interval: Duration,
    /// Silence tolerated before the session is considered dead.
    pub timeout: Duration,
    /// Text frame to send instead of a websocket Ping.
    pub payload: Option<String>,
}

/// Everything the upstream connector needs.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Websocket endpoint.
    pub uri: Url,
    /// Extra handshake headers.
    pub headers: BTreeMap<String, String>,
    /// Optional token bootstrap.
    pub token: Option<TokenBootstrap>,
    /// Frames sent while authenticating.
    pub auth_frames: Vec<Value>,
    /// Frames sent once authenticated.
    pub subscribe_frames: Vec<Value>,
    /// `"type"` values that mark protocol control frames.
    pub control_frame_types: Vec<String>,
    /// Bound on token fetch plus handshake.
    pub connect_timeout: Duration,
    /// Consecutive failed connects before giving up; `None` is unbounded.
    pub max_connect_attempts: Option<u32>,
    /// Malformed frames in a row before the session is recycled.
    pub max_consecutive_protocol_errors: u32,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
}

/// Everything the HTTP sink needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamConfig {
    /// Sink endpoint.
    pub uri: Url,
    /// Delivery method.
    pub method: http::Method,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Optional bearer token.
    pub bearer_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

/// Delivery buffer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Capacity in envelopes.
    pub capacity: usize,
    /// Behaviour at capacity.
    pub overflow: OverflowPolicy,
}

/// Batching settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Envelopes per batch.
    pub max_count: usize,
    /// Payload bytes per batch.
    pub max_bytes: usize,
    /// Flush deadline measured from the oldest pending envelope.
    pub timeout: Duration,
}

/// Delivery retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retry_attempts: u32,
    /// What to do once retries are exhausted or a permanent error occurs.
    pub fatal_policy: FatalDeliveryPolicy,
}

/// Backoff settings shared by every retrying component.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First delay.
    pub base: Duration,
    /// Growth factor.
    pub multiplier: f64,
    /// Largest delay.
    pub cap: Duration,
    /// Jitter fraction.
    pub jitter: f64,
    /// Optional jitter seed.
    pub seed: Option<u64>,
}

impl BackoffConfig {
    /// Builds the policy.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base, self.multiplier, self.cap, self.jitter, self.seed)
    }
}

/// # Ingestor Config
///
/// The validated configuration, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestorConfig {
    /// Upstream connector settings.
    pub upstream: UpstreamConfig,
    /// Downstream sink settings.
    pub downstream: DownstreamConfig,
    /// Buffer settings.
    pub buffer: BufferConfig,
    /// Batching settings.
    pub batch: BatchConfig,
    /// Retry settings.
    pub retry: RetryConfig,
    /// Backoff settings.
    pub backoff: BackoffConfig,
    /// Bound on draining during graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Crash restarts allowed per unit.
    pub max_unit_restarts: u32,
}
