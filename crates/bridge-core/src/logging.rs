//! Tracing subscriber setup for processes hosting the bridge core
//!
//! The library itself only emits `tracing` events; binaries and tests call
//! [`setup_logging`] once to install a subscriber.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSection;
use crate::error::{BridgeError, Result};

/// Subscriber settings for a process hosting bridges
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Baseline level; `RUST_LOG` directives are layered on top
    pub level: Level,
    pub json: bool,
    /// Emit `file:line` with each event
    pub file_info: bool,
    /// Report entry and exit of the `bridge_join` / `bridge_impart` spans
    /// that wrap every channel driver
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "rvoip-bridge".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Settings from the `[logging]` table of a
    /// [`BridgeConfig`](crate::config::BridgeConfig). An unknown level name
    /// is a config error rather than a silent fallback.
    pub fn from_section(section: &LoggingSection) -> Result<Self> {
        let mut config = LoggingConfig::new(parse_log_level(&section.level)?, "rvoip-bridge");
        config.json = section.json;
        Ok(config)
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install the global `fmt` subscriber.
///
/// Only one subscriber can exist per process, so a second call returns
/// [`BridgeError::Config`] instead of panicking. JSON output goes to stdout.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };

    installed.map_err(|e| BridgeError::Config(format!("Failed to install subscriber: {}", e)))?;
    log_welcome(&config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Case-insensitive: `"debug"`, `"DEBUG"` and `"Debug"` all parse
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| BridgeError::Config(format!("Invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{} (bridge core)", app_name, version);
}
