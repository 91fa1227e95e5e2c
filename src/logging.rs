//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output formats.
//!
//! The filter is taken from `ADM_LOG`, then `RUST_LOG`, then the default
//! level of the selected [`LogConfig`].

use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Create a development configuration (plaintext, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::DEBUG,
        }
    }

    /// Create a production configuration (JSON, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            default_level: Level::INFO,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    if INIT_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = resolve_env_filter(config.default_level);

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }

    let _ = INIT_GUARD.set(());
    Ok(())
}

/// Resolve the env filter from `ADM_LOG`, then `RUST_LOG`, then the default.
fn resolve_env_filter(default_level: Level) -> EnvFilter {
    if let Ok(spec) = std::env::var("ADM_LOG") {
        if !spec.is_empty() {
            if let Ok(filter) = EnvFilter::try_new(&spec) {
                return filter;
            }
        }
    }
    if let Ok(spec) = std::env::var("RUST_LOG") {
        if !spec.is_empty() {
            if let Ok(filter) = EnvFilter::try_new(&spec) {
                return filter;
            }
        }
    }
    EnvFilter::new(default_level.to_string().to_lowercase())
}
