//! Core transport types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Enumerates the types of transports supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Standard Input/Output, a long-lived byte stream.
    Stdio,
    /// HTTP, one request/response exchange per message.
    Http,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            other => Err(TransportError::NotAvailable(format!(
                "unknown transport type: {other}"
            ))),
        }
    }
}

/// Represents the current state of a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// The transport is not connected.
    Disconnected,
    /// The transport is in the process of connecting.
    Connecting,
    /// The transport is connected and ready to send/receive messages.
    Connected,
    /// The transport is in the process of disconnecting.
    Disconnecting,
    /// The transport has encountered an unrecoverable error.
    Failed {
        /// A description of the failure reason.
        reason: String,
    },
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of a transport health check.
///
/// `healthy` is the conjunction of every named check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall health
    pub healthy: bool,
    /// Individual check results by name (e.g. `connectivity`, `configuration`)
    pub checks: BTreeMap<String, bool>,
}

impl HealthReport {
    /// Builds a report from named checks.
    pub fn from_checks<I, K>(checks: I) -> Self
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        let checks: BTreeMap<String, bool> =
            checks.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let healthy = !checks.is_empty() && checks.values().all(|ok| *ok);
        Self { healthy, checks }
    }

    /// Looks up a single check.
    pub fn check(&self, name: &str) -> Option<bool> {
        self.checks.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::Stdio.to_string(), "stdio");
        assert_eq!(TransportType::Http.to_string(), "http");
    }

    #[test]
    fn test_transport_type_parse() {
        assert_eq!("STDIO".parse::<TransportType>().unwrap(), TransportType::Stdio);
        assert_eq!("http".parse::<TransportType>().unwrap(), TransportType::Http);
        assert!("carrier-pigeon".parse::<TransportType>().is_err());
    }

    #[test]
    fn test_transport_state_display() {
        assert_eq!(TransportState::Connected.to_string(), "connected");
        assert_eq!(TransportState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            TransportState::Failed {
                reason: "timeout".to_string()
            }
            .to_string(),
            "failed: timeout"
        );
    }

    #[test]
    fn test_health_report_conjunction() {
        let report = HealthReport::from_checks([("connectivity", true), ("configuration", true)]);
        assert!(report.healthy);

        let report = HealthReport::from_checks([("connectivity", false), ("configuration", true)]);
        assert!(!report.healthy);
        assert_eq!(report.check("connectivity"), Some(false));
        assert_eq!(report.check("missing"), None);
    }
}
