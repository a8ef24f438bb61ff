//! # Loggers
//!
//! Process-wide logging through the `log` facade, dispatched by `fern` to a
//! colored console and, optionally, a timestamped file per run.

/// Console and file logging setup.
pub mod logger;

pub use logger::{cleanup_old_logs, parse_level, setup_logging};
