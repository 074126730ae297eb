//! Transport configuration.
//!
//! A [`TransportConfig`] is an immutable, ordered key/value map. Transports
//! build one at `initialize` time by layering caller overrides on top of the
//! per-type defaults from [`TransportConfig::defaults_for`]. Ordering is
//! deterministic, which the connection pool relies on when deriving keys.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{TransportError, TransportResult};
use crate::types::TransportType;

/// Well-known configuration keys.
pub mod keys {
    /// Per-operation timeout in seconds (number, > 0).
    pub const TIMEOUT: &str = "timeout";
    /// Extra send attempts after the first (integer, >= 0).
    pub const RETRY_ATTEMPTS: &str = "retry_attempts";
    /// Delay between send attempts in milliseconds (number, >= 0).
    pub const RETRY_DELAY: &str = "retry_delay";

    /// Stdio framing mode: `"line"` or `"content-length"`.
    pub const FRAMING: &str = "framing";
    /// Line delimiter for line framing.
    pub const LINE_DELIMITER: &str = "line_delimiter";
    /// Maximum buffered bytes without a message boundary.
    pub const MAX_BUFFER_SIZE: &str = "max_buffer_size";
    /// Listen-loop readiness poll interval in milliseconds.
    pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
    /// Bytes requested per stream read.
    pub const READ_CHUNK_SIZE: &str = "read_chunk_size";
    /// Whether stdio transports install SIGTERM/SIGINT/SIGHUP handlers.
    pub const HANDLE_SIGNALS: &str = "handle_signals";

    /// HTTP scheme (`http` or `https`).
    pub const SCHEME: &str = "scheme";
    /// HTTP host name.
    pub const HOST: &str = "host";
    /// HTTP port.
    pub const PORT: &str = "port";
    /// HTTP path the transport is mounted on.
    pub const PATH: &str = "path";
    /// Allowed CORS origins.
    pub const CORS_ALLOWED_ORIGINS: &str = "cors_allowed_origins";
    /// Allowed CORS methods.
    pub const CORS_ALLOWED_METHODS: &str = "cors_allowed_methods";
    /// Allowed CORS request headers.
    pub const CORS_ALLOWED_HEADERS: &str = "cors_allowed_headers";
    /// CORS preflight max-age in seconds.
    pub const CORS_MAX_AGE: &str = "cors_max_age";
}

/// Default ceiling for framing and line buffers (10 MiB).
const DEFAULT_MAX_BUFFER_SIZE: u64 = 10 * 1024 * 1024;

/// Immutable key/value transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportConfig {
    values: BTreeMap<String, Value>,
}

impl TransportConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing map.
    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// The defaults applied to every transport of `transport_type`.
    pub fn defaults_for(transport_type: TransportType) -> Self {
        let mut values = BTreeMap::new();
        values.insert(keys::TIMEOUT.to_string(), json!(30));
        values.insert(keys::RETRY_ATTEMPTS.to_string(), json!(3));
        values.insert(keys::RETRY_DELAY.to_string(), json!(1000));

        match transport_type {
            TransportType::Stdio => {
                values.insert(keys::FRAMING.to_string(), json!("line"));
                values.insert(keys::LINE_DELIMITER.to_string(), json!("\n"));
                values.insert(keys::MAX_BUFFER_SIZE.to_string(), json!(DEFAULT_MAX_BUFFER_SIZE));
                values.insert(keys::POLL_INTERVAL_MS.to_string(), json!(10));
                values.insert(keys::READ_CHUNK_SIZE.to_string(), json!(8192));
                values.insert(keys::HANDLE_SIGNALS.to_string(), json!(true));
            }
            TransportType::Http => {
                values.insert(keys::SCHEME.to_string(), json!("http"));
                values.insert(keys::HOST.to_string(), json!("localhost"));
                values.insert(keys::PORT.to_string(), json!(8080));
                values.insert(keys::PATH.to_string(), json!("/"));
                values.insert(keys::CORS_ALLOWED_ORIGINS.to_string(), json!(["*"]));
                values.insert(keys::CORS_ALLOWED_METHODS.to_string(), json!(["POST", "OPTIONS"]));
                values.insert(
                    keys::CORS_ALLOWED_HEADERS.to_string(),
                    json!(["Content-Type", "Authorization"]),
                );
                values.insert(keys::CORS_MAX_AGE.to_string(), json!(86400));
            }
        }

        Self { values }
    }

    /// Returns a new configuration with `overrides` layered on top of `self`.
    #[must_use]
    pub fn merged_with(&self, overrides: &Self) -> Self {
        let mut values = self.values.clone();
        values.extend(
            overrides
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self { values }
    }

    /// Returns a copy with one key replaced.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = self.values.clone();
        values.insert(key.into(), value.into());
        Self { values }
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value lookup.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Non-negative integer lookup.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    /// Numeric lookup.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Boolean lookup.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    /// A list of strings; a single string is treated as a one-element list.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.values.get(key)? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Per-operation timeout (default 30s).
    pub fn timeout(&self) -> Duration {
        self.get_f64(keys::TIMEOUT)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::from_secs(30))
    }

    /// Extra send attempts after the first (default 3).
    pub fn retry_attempts(&self) -> u32 {
        self.get_u64(keys::RETRY_ATTEMPTS)
            .map_or(3, |n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Delay between send attempts (default 1000ms).
    pub fn retry_delay(&self) -> Duration {
        self.get_f64(keys::RETRY_DELAY)
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
            .unwrap_or(Duration::from_millis(1000))
    }

    /// Validates the well-known keys that are present.
    pub fn validate(&self) -> TransportResult<()> {
        if let Some(timeout) = self.get(keys::TIMEOUT) {
            match timeout.as_f64() {
                Some(secs) if secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok() => {}
                _ => {
                    return Err(TransportError::ConfigurationError(format!(
                        "timeout must be a representable number of seconds greater than 0, got {timeout}"
                    )));
                }
            }
        }

        if let Some(attempts) = self.get(keys::RETRY_ATTEMPTS)
            && attempts.as_u64().is_none()
        {
            return Err(TransportError::ConfigurationError(format!(
                "retry_attempts must be an integer >= 0, got {attempts}"
            )));
        }

        if let Some(delay) = self.get(keys::RETRY_DELAY) {
            match delay.as_f64() {
                Some(ms) if Duration::try_from_secs_f64(ms / 1000.0).is_ok() => {}
                _ => {
                    return Err(TransportError::ConfigurationError(format!(
                        "retry_delay must be a representable number of milliseconds >= 0, got {delay}"
                    )));
                }
            }
        }

        if let Some(size) = self.get(keys::MAX_BUFFER_SIZE) {
            match size.as_u64() {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(TransportError::ConfigurationError(format!(
                        "max_buffer_size must be a positive integer, got {size}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrow the underlying map.
    pub const fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for TransportConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Builder for transport configurations
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    values: BTreeMap<String, Value>,
}

impl TransportConfigBuilder {
    /// Create a new config builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the defaults of a transport type
    #[must_use]
    pub fn for_type(transport_type: TransportType) -> Self {
        Self {
            values: TransportConfig::defaults_for(transport_type).values,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.values
            .insert(keys::TIMEOUT.to_string(), json!(timeout.as_secs_f64()));
        self
    }

    /// Set retry attempts
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.values
            .insert(keys::RETRY_ATTEMPTS.to_string(), json!(attempts));
        self
    }

    /// Set retry delay
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.values
            .insert(keys::RETRY_DELAY.to_string(), json!(delay.as_millis() as u64));
        self
    }

    /// Set an arbitrary key
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> TransportResult<TransportConfig> {
        let config = TransportConfig {
            values: self.values,
        };
        config.validate()?;
        Ok(config)
    }
}
