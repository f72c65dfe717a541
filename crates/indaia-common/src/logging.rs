//! Logging setup for hosts embedding the worker.
//!
//! Levels are set per worker crate: `indaia_sw` decides routes and runs the
//! lifecycle, `indaia_net` talks to the network. Everything the worker logs
//! while handling an event happens inside a [`worker_span`], so a host running
//! an old and a new worker generation side by side can tell them apart.

use std::str::FromStr;

use tracing::{Level, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{IndaiaError, Result};

/// Environment variable holding a full filter directive, e.g.
/// `indaia_sw=trace,reqwest=warn`.
pub const LOG_ENV: &str = "INDAIA_LOG";

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "INDAIA_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON for log shippers.
    Json,
}

impl FromStr for LogFormat {
    type Err = IndaiaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(IndaiaError::config(format!("unknown log format {other:?}"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for routing, caching and lifecycle events (`indaia_sw`).
    pub worker_level: Level,
    /// Level for network fetches (`indaia_net`).
    pub net_level: Level,
    /// Level for every other target (reqwest, hyper, ...).
    pub default_level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file and line.
    pub include_location: bool,
    /// Full filter directive; replaces the three levels when set.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            worker_level: Level::INFO,
            net_level: Level::WARN,
            default_level: Level::WARN,
            format: LogFormat::Compact,
            include_location: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Every routing decision and fetch, with source locations.
    pub fn debug() -> Self {
        Self {
            worker_level: Level::DEBUG,
            net_level: Level::DEBUG,
            format: LogFormat::Pretty,
            include_location: true,
            ..Default::default()
        }
    }

    /// JSON lines with lifecycle transitions and degraded paths only.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Defaults overridden by [`LOG_ENV`] and [`LOG_FORMAT_ENV`].
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            std::env::var(LOG_ENV).ok(),
            std::env::var(LOG_FORMAT_ENV).ok(),
        )
    }

    fn from_values(filter: Option<String>, format: Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
            config.filter = Some(filter);
        }
        if let Some(format) = format {
            config.format = format.parse()?;
        }
        Ok(config)
    }

    /// Set a full filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The filter directive this configuration installs.
    pub fn directives(&self) -> String {
        match &self.filter {
            Some(filter) => filter.clone(),
            None => format!(
                "{},indaia_sw={},indaia_net={}",
                level_name(self.default_level),
                level_name(self.worker_level),
                level_name(self.net_level),
            ),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let directives = self.directives();
        EnvFilter::try_new(&directives).map_err(|e| {
            IndaiaError::config_with_source(format!("invalid log filter {directives:?}"), e)
        })
    }
}

fn level_name(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which is the
/// normal case for a worker restarted inside a long-lived host.
pub fn init_logging(config: &LogConfig) -> Result<bool> {
    let filter = config.env_filter()?;

    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    Ok(installed.is_ok())
}

/// Span wrapping everything one worker generation logs.
pub fn worker_span(app_name: &str, version: &str) -> Span {
    tracing::info_span!("worker", app = %app_name, version = %version)
}
