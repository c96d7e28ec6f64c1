//! Tracing subscriber setup
//!
//! Library crates only emit `tracing` events; binaries decide where they go.
//! This module installs a `tracing-subscriber` registry with:
//! - an `EnvFilter` (`RUST_LOG` wins over the configured level)
//! - one of three output formats (pretty, compact, JSON)
//! - output on stderr, so dumped samples on stdout stay clean
//!
//! # Example
//! ```no_run
//! use dsm_daq::logging::{self, LogFormat, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggingConfig {
//!     level: "debug".into(),
//!     format: LogFormat::Json,
//!     ..Default::default()
//! };
//! logging::init(&config)?;
//! tracing::info!(channel = "ttyS0", "acquisition started");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (for development)
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// JSON objects for log aggregation
    Json,
}

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names (sorter flush threads are named `sorter-<name>`)
    pub with_thread_names: bool,
    /// ANSI colours (ignored for JSON)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

/// Parse a log level name, case insensitive
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn fmt_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    match config.format {
        LogFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(config.with_ansi).boxed(),
        LogFormat::Json => layer.json().with_ansi(false).boxed(),
    }
}

/// Install the global subscriber
///
/// Idempotent: when a subscriber is already installed (tests, embedding
/// applications) this returns Ok(()) and leaves it in place.
pub fn init(config: &LoggingConfig) -> Result<(), String> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(fmt_layer(config).with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Expected when tests or a host application installed one first
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}
