use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use lib_ingestor::configs::{ConfigError, IngestorConfig, IngestorSettings};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_CONFIG_FILE: &str = "server_ingestor.conf";
const DEFAULT_ADMIN_PORT: u16 = 8081;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Websocket to HTTP ingestion relay", version)]
pub struct Args {
    #[clap(long, env = "INGESTOR_CONFIG", help = "Path to the JSON configuration file.")]
    pub config: Option<PathBuf>,

    #[clap(long, env = "INGESTOR_ADMIN_PORT", help = "Admin REST port, 0 disables it.")]
    pub admin_port: Option<u16>,

    #[clap(long, env = "INGESTOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "INGESTOR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "INGESTOR_UPSTREAM_URI", help = "Upstream websocket endpoint (ws:// or wss://).")]
    pub upstream_uri: Option<String>,

    #[clap(long, env = "INGESTOR_UPSTREAM_HEADERS", help = "Handshake headers as a JSON object.")]
    pub upstream_headers: Option<String>,

    #[clap(long, env = "INGESTOR_TOKEN_URL", help = "Token bootstrap endpoint, POSTed before each handshake.")]
    pub token_url: Option<String>,

    #[clap(long, env = "INGESTOR_TOKEN_POINTER", help = "JSON pointer of the token in the bootstrap response.")]
    pub token_pointer: Option<String>,

    #[clap(long, env = "INGESTOR_ENDPOINT_POINTER", help = "JSON pointer of a replacement websocket endpoint.")]
    pub endpoint_pointer: Option<String>,

    #[clap(long, env = "INGESTOR_TOKEN_QUERY_PARAM", help = "Query parameter the token is appended as.")]
    pub token_query_param: Option<String>,

    #[clap(long, env = "INGESTOR_TOKEN_FETCH_RETRIES", help = "Retries for the bootstrap request.")]
    pub token_fetch_retries: Option<u32>,

    #[clap(long, env = "INGESTOR_AUTH_FRAMES", help = "Authentication frames as a JSON array.")]
    pub auth_frames: Option<String>,

    #[clap(long, env = "INGESTOR_SUBSCRIBE_FRAMES", help = "Subscription frames as a JSON array.")]
    pub subscribe_frames: Option<String>,

    #[clap(long, env = "INGESTOR_CONTROL_FRAME_TYPES", help = "Comma separated \"type\" values of control frames.")]
    pub control_frame_types: Option<String>,

    #[clap(long, env = "INGESTOR_CONNECT_TIMEOUT_MS", help = "Bound on token fetch and handshake.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_MAX_CONNECT_ATTEMPTS", help = "Consecutive failed connects before giving up, 0 is unbounded.")]
    pub max_connect_attempts: Option<u32>,

    #[clap(long, env = "INGESTOR_MAX_CONSECUTIVE_PROTOCOL_ERRORS", help = "Malformed frames in a row before the session is recycled.")]
    pub max_consecutive_protocol_errors: Option<u32>,

    #[clap(long, env = "INGESTOR_HEARTBEAT_INTERVAL_MS", help = "Heartbeat period.")]
    pub heartbeat_interval_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_HEARTBEAT_TIMEOUT_MS", help = "Silence limit before the session is failed.")]
    pub heartbeat_timeout_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_HEARTBEAT_PAYLOAD", help = "Text heartbeat frame sent instead of a websocket ping.")]
    pub heartbeat_payload: Option<String>,

    #[clap(long, env = "INGESTOR_DOWNSTREAM_URI", help = "Downstream HTTP sink endpoint.")]
    pub downstream_uri: Option<String>,

    #[clap(long, env = "INGESTOR_DOWNSTREAM_METHOD", help = "HTTP method used for delivery.")]
    pub downstream_method: Option<String>,

    #[clap(long, env = "INGESTOR_DOWNSTREAM_HEADERS", help = "Delivery headers as a JSON object.")]
    pub downstream_headers: Option<String>,

    #[clap(long, env = "INGESTOR_DOWNSTREAM_BEARER_TOKEN", help = "Bearer token for the downstream sink.")]
    pub downstream_bearer_token: Option<String>,

    #[clap(long, env = "INGESTOR_REQUEST_TIMEOUT_MS", help = "Per-delivery HTTP timeout.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_BUFFER_CAPACITY", help = "Buffer capacity in messages.")]
    pub buffer_capacity: Option<usize>,

    #[clap(long, env = "INGESTOR_OVERFLOW_POLICY", help = "block, drop-oldest or reject.")]
    pub overflow_policy: Option<String>,

    #[clap(long, env = "INGESTOR_MAX_BATCH_COUNT", help = "Messages per batch.")]
    pub max_batch_count: Option<usize>,

    #[clap(long, env = "INGESTOR_MAX_BATCH_BYTES", help = "Payload bytes per batch.")]
    pub max_batch_bytes: Option<usize>,

    #[clap(long, env = "INGESTOR_BATCH_TIMEOUT_MS", help = "Flush deadline from the oldest pending message.")]
    pub batch_timeout_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_MAX_RETRY_ATTEMPTS", help = "Retries after the first delivery attempt.")]
    pub max_retry_attempts: Option<u32>,

    #[clap(long, env = "INGESTOR_FATAL_DELIVERY_POLICY", help = "halt or drop.")]
    pub fatal_delivery_policy: Option<String>,

    #[clap(long, env = "INGESTOR_BACKOFF_BASE_MS")]
    pub backoff_base_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_BACKOFF_MULTIPLIER")]
    pub backoff_multiplier: Option<f64>,

    #[clap(long, env = "INGESTOR_BACKOFF_CAP_MS")]
    pub backoff_cap_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_BACKOFF_JITTER")]
    pub backoff_jitter: Option<f64>,

    #[clap(long, env = "INGESTOR_BACKOFF_SEED")]
    pub backoff_seed: Option<u64>,

    #[clap(long, env = "INGESTOR_SHUTDOWN_TIMEOUT_MS", help = "Bound on the drain during a graceful stop.")]
    pub shutdown_timeout_ms: Option<u64>,

    #[clap(long, env = "INGESTOR_MAX_UNIT_RESTARTS", help = "Crash restarts allowed per pipeline unit.")]
    pub max_unit_restarts: Option<u32>,
}

/// Server-only keys that may sit next to the pipeline settings in the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileLayer {
    #[serde(flatten)]
    pipeline: IngestorSettings,
    admin_port: Option<u16>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

/// Everything `server_ingestor` needs to run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pipeline: IngestorConfig,
    pub admin_port: u16,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Args {
    /// The pipeline layer carried by flags and environment variables.
    pub fn settings(&self) -> Result<IngestorSettings, ConfigError> {
        Ok(IngestorSettings {
            upstream_uri: self.upstream_uri.clone(),
            upstream_headers: json_arg("upstreamHeaders", self.upstream_headers.as_deref())?,
            token_url: self.token_url.clone(),
            token_pointer: self.token_pointer.clone(),
            endpoint_pointer: self.endpoint_pointer.clone(),
            token_query_param: self.token_query_param.clone(),
            token_fetch_retries: self.token_fetch_retries,
            auth_frames: json_arg::<Vec<Value>>("authFrames", self.auth_frames.as_deref())?,
            subscribe_frames: json_arg::<Vec<Value>>("subscribeFrames", self.subscribe_frames.as_deref())?,
            control_frame_types: self.control_frame_types.as_deref().map(split_list),
            connect_timeout_ms: self.connect_timeout_ms,
            max_connect_attempts: self.max_connect_attempts,
            max_consecutive_protocol_errors: self.max_consecutive_protocol_errors,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            heartbeat_payload: self.heartbeat_payload.clone(),
            downstream_uri: self.downstream_uri.clone(),
            downstream_method: self.downstream_method.clone(),
            downstream_headers: json_arg::<BTreeMap<String, String>>(
                "downstreamHeaders",
                self.downstream_headers.as_deref(),
            )?,
            downstream_bearer_token: self.downstream_bearer_token.clone(),
            request_timeout_ms: self.request_timeout_ms,
            buffer_capacity: self.buffer_capacity,
            overflow_policy: self.overflow_policy.clone(),
            max_batch_count: self.max_batch_count,
            max_batch_bytes: self.max_batch_bytes,
            batch_timeout_ms: self.batch_timeout_ms,
            max_retry_attempts: self.max_retry_attempts,
            fatal_delivery_policy: self.fatal_delivery_policy.clone(),
            backoff_base_ms: self.backoff_base_ms,
            backoff_multiplier: self.backoff_multiplier,
            backoff_cap_ms: self.backoff_cap_ms,
            backoff_jitter: self.backoff_jitter,
            backoff_seed: self.backoff_seed,
            shutdown_timeout_ms: self.shutdown_timeout_ms,
            max_unit_restarts: self.max_unit_restarts,
        })
    }
}

fn json_arg<T: for<'de> Deserialize<'de>>(key: &'static str, raw: Option<&str>) -> Result<Option<T>, ConfigError> {
    raw.map(|text| {
        serde_json::from_str(text).map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })
    })
    .transpose()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_file_layer(path: &Path) -> Result<FileLayer, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// # Load Config
///
/// Layers defaults, then the config file, then environment variables and flags.
/// An explicitly named config file must exist; the default one is optional.
pub fn load_config(args: &Args) -> Result<ServerConfig, ConfigError> {
    let file = match &args.config {
        Some(path) => read_file_layer(path)?,
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if path.exists() {
                read_file_layer(&path)?
            } else {
                log::info!("Config file {} not found, using defaults, environment and flags.", path.display());
                FileLayer::default()
            }
        }
    };

    let pipeline = IngestorSettings::defaults()
        .merge(file.pipeline)
        .merge(args.settings()?)
        .into_config()?;

    Ok(ServerConfig {
        pipeline,
        admin_port: args.admin_port.or(file.admin_port).unwrap_or(DEFAULT_ADMIN_PORT),
        log_dir: args.log_dir.clone().or(file.log_dir),
        log_level: args
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
    })
}
