//! # Indaia Common
//!
//! Error type and logging setup shared by the Indaia offline worker crates.
//!
//! Everything that can go wrong before the worker handles its first event
//! (a bad configuration file, a manifest entry that does not resolve, an
//! unreadable path) is an [`IndaiaError`]. Runtime failures belong to the
//! worker crate's own error type.

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, worker_span, LogConfig, LogFormat};

/// Setup error for the Indaia worker.
#[derive(Error, Debug)]
pub enum IndaiaError {
    /// Invalid or inconsistent configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A resource manifest entry that cannot be used.
    #[error("Manifest entry {entry:?}: {reason}")]
    Manifest { entry: String, reason: String },

    /// Reading configuration from disk failed.
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl IndaiaError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a manifest error for `entry`.
    pub fn manifest(entry: impl Into<String>, reason: impl ToString) -> Self {
        Self::Manifest {
            entry: entry.into(),
            reason: reason.to_string(),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            IndaiaError::Config { .. } => "config",
            IndaiaError::Manifest { .. } => "manifest",
            IndaiaError::Io { .. } => "io",
        }
    }
}

/// Result type alias for Indaia setup operations.
pub type Result<T> = std::result::Result<T, IndaiaError>;

/// Extension trait for I/O results.
pub trait ResultExt<T> {
    /// Wrap an I/O failure with what was being done.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for std::io::Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|source| IndaiaError::Io {
            message: message.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_categories() {
        assert_eq!(IndaiaError::config("bad").category(), "config");
        assert_eq!(
            IndaiaError::manifest("/app.js", "relative URL without a base").category(),
            "manifest"
        );
    }

    #[test]
    fn test_manifest_error_names_entry() {
        let err = IndaiaError::manifest("http://[::1", "invalid IPv6 address");
        assert_eq!(
            err.to_string(),
            "Manifest entry \"http://[::1\": invalid IPv6 address"
        );
    }

    #[test]
    fn test_config_error_keeps_source() {
        let err = IndaiaError::config_with_source("invalid worker config", std::fmt::Error);
        assert!(err.source().is_some());
        assert!(IndaiaError::config("no source").source().is_none());
    }

    #[test]
    fn test_context_wraps_io_error() {
        let failed: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = failed.context("reading worker config sw.json").unwrap_err();
        assert_eq!(err.category(), "io");
        assert_eq!(err.to_string(), "IO error: reading worker config sw.json");
        assert_eq!(err.source().unwrap().to_string(), "missing");
    }
}
