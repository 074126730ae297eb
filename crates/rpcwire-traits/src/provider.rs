//! Configuration sources.
//!
//! Transports consult a [`ConfigProvider`] when reloading (e.g. on `SIGHUP`).
//! The provider's snapshot is layered over the transport's current config.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::TransportConfig;

/// Supplies configuration values by key.
pub trait ConfigProvider: Send + Sync + std::fmt::Debug {
    /// Looks up one key.
    fn get(&self, key: &str) -> Option<Value>;

    /// All values currently known to the provider.
    fn snapshot(&self) -> TransportConfig;
}

/// An in-memory provider whose contents can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    config: RwLock<TransportConfig>,
}

impl StaticConfigProvider {
    /// Creates a provider serving `config`.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replaces the served configuration.
    pub fn replace(&self, config: TransportConfig) {
        *self.config.write() = config;
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn get(&self, key: &str) -> Option<Value> {
        self.config.read().get(key).cloned()
    }

    fn snapshot(&self) -> TransportConfig {
        self.config.read().clone()
    }
}

/// Reads `PREFIX_KEY` environment variables.
///
/// `RPCWIRE_TIMEOUT=5` yields `timeout = 5`. Values that parse as JSON
/// scalars or arrays are taken as such, anything else as a string.
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: String,
}

impl EnvConfigProvider {
    /// Creates a provider for variables starting with `prefix` followed by `_`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_ascii_uppercase())
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new("RPCWIRE")
    }
}

fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Array(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get(&self, key: &str) -> Option<Value> {
        std::env::var(self.var_name(key))
            .ok()
            .map(|raw| parse_env_value(&raw))
    }

    fn snapshot(&self) -> TransportConfig {
        let prefix = format!("{}_", self.prefix);
        let values: BTreeMap<String, Value> = std::env::vars()
            .filter_map(|(name, raw)| {
                let key = name.strip_prefix(&prefix)?;
                Some((key.to_ascii_lowercase(), parse_env_value(&raw)))
            })
            .collect();
        TransportConfig::from_map(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use serde_json::json;

    #[test]
    fn test_static_provider_replace() {
        let provider = StaticConfigProvider::new(TransportConfig::new().with(keys::TIMEOUT, 5));
        assert_eq!(provider.get(keys::TIMEOUT), Some(json!(5)));

        provider.replace(TransportConfig::new().with(keys::TIMEOUT, 9));
        assert_eq!(provider.snapshot().get_u64(keys::TIMEOUT), Some(9));
        assert_eq!(provider.get("missing"), None);
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value("5"), json!(5));
        assert_eq!(parse_env_value("0.5"), json!(0.5));
        assert_eq!(parse_env_value("true"), json!(true));
        assert_eq!(parse_env_value("[\"*\"]"), json!(["*"]));
        assert_eq!(parse_env_value("localhost"), json!("localhost"));
        assert_eq!(parse_env_value("\n"), json!("\n"));
    }

    #[test]
    fn test_env_var_name() {
        let provider = EnvConfigProvider::new("APP");
        assert_eq!(provider.var_name("retry_delay"), "APP_RETRY_DELAY");
    }
}
