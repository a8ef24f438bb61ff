//! # Configuration Modules
//!
//! Settings arrive as loosely typed layers (built-in defaults, a JSON file, the
//! environment and the command line) and are validated exactly once into an
//! immutable `IngestorConfig`. Components receive the slice they need at
//! construction and never look anything up at runtime.

/// Layered ingestor settings and their validated form.
pub mod config_ingestor;

pub use config_ingestor::{
    BackoffConfig, BatchConfig, BufferConfig, ConfigError, DownstreamConfig, FatalDeliveryPolicy,
    HeartbeatConfig, IngestorConfig, IngestorSettings, RetryConfig, TokenBootstrap, UpstreamConfig,
};
