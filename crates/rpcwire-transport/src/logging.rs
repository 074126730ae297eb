//! Logging initialization.
//!
//! Stdout carries the stdio protocol, so logs go to stderr, to a file, or
//! nowhere.
//!
//! | Output | Guard returned |
//! |--------|----------------|
//! | `Stderr` | no |
//! | `File` | **yes**, hold it until exit or buffered lines are lost |
//! | `None` | no |
//!
//! ```rust,no_run
//! use rpcwire_transport::logging::LoggingConfig;
//!
//! let _guard = LoggingConfig::file("/var/log/rpcwire").init()?;
//! # Ok::<(), rpcwire_transport::logging::LoggingError>(())
//! ```

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// `level` is not a valid filter directive.
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter {
        /// The rejected directive
        filter: String,
        /// Parser message
        reason: String,
    },

    /// The log directory could not be created.
    #[error("log directory: {0}")]
    Io(#[from] io::Error),

    /// A global subscriber is already installed.
    #[error("tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Where log lines go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LogOutput {
    /// Standard error
    #[default]
    Stderr,
    /// A non-rotating file `directory/file_prefix`
    File {
        /// Directory, created if missing
        directory: PathBuf,
        /// File name
        file_prefix: String,
    },
    /// Logging disabled
    None,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `rpcwire_transport=debug`
    pub level: String,
    /// Destination
    pub output: LogOutput,
    /// JSON lines instead of human-readable text
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stderr,
            structured: false,
        }
    }
}

/// Flushes buffered file output on drop.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

impl LoggingConfig {
    /// Human-readable stderr at `level`.
    pub fn stderr(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// JSON lines to `directory/rpcwire.log`.
    pub fn file(directory: impl Into<PathBuf>) -> Self {
        Self {
            output: LogOutput::File {
                directory: directory.into(),
                file_prefix: "rpcwire.log".to_string(),
            },
            structured: true,
            ..Self::default()
        }
    }

    /// Builds the filter: `RUST_LOG` if set and valid, else `level`.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| LoggingError::InvalidFilter {
                filter: self.level.clone(),
                reason: e.to_string(),
            })
    }

    /// Installs the global subscriber.
    ///
    /// Returns a guard for file output, which must be held.
    pub fn init(&self) -> Result<Option<LoggingGuard>, LoggingError> {
        let filter = self.env_filter()?;
        let registry = tracing_subscriber::registry().with(filter);

        match &self.output {
            LogOutput::None => Ok(None),
            LogOutput::Stderr => {
                let result = if self.structured {
                    registry
                        .with(fmt::layer().json().with_writer(io::stderr))
                        .try_init()
                } else {
                    registry.with(fmt::layer().with_writer(io::stderr)).try_init()
                };
                result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
                Ok(None)
            }
            LogOutput::File {
                directory,
                file_prefix,
            } => {
                std::fs::create_dir_all(directory)?;
                let appender = tracing_appender::rolling::never(directory, file_prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let result = if self.structured {
                    registry
                        .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                        .try_init()
                } else {
                    registry
                        .with(fmt::layer().with_ansi(false).with_writer(writer))
                        .try_init()
                };
                result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
                Ok(Some(LoggingGuard { _file_guard: guard }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(!config.structured);
    }

    #[test]
    fn test_file_preset() {
        let config = LoggingConfig::file("/tmp/logs");
        assert!(config.structured);
        assert_eq!(
            config.output,
            LogOutput::File {
                directory: PathBuf::from("/tmp/logs"),
                file_prefix: "rpcwire.log".to_string()
            }
        );
    }

    #[test]
    fn test_deserialize() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"level":"debug","output":{"kind":"file","directory":"/var/log/x","file_prefix":"x.log"}}"#,
        )
        .unwrap();
        assert_eq!(config.level, "debug");
        assert!(matches!(config.output, LogOutput::File { .. }));

        let config: LoggingConfig = serde_json::from_str(r#"{"output":{"kind":"none"}}"#).unwrap();
        assert_eq!(config.output, LogOutput::None);
    }

    #[test]
    fn test_none_output_installs_nothing() {
        let config = LoggingConfig {
            output: LogOutput::None,
            ..LoggingConfig::default()
        };
        assert!(config.init().unwrap().is_none());
    }

    #[test]
    fn test_file_output_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");
        let guard = LoggingConfig::file(&logs).init().unwrap();
        assert!(guard.is_some());
        assert!(logs.is_dir());
        tracing::info!("written to file");
    }
}
