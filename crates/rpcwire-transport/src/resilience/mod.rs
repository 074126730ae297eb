//! Fault tolerance for transports.
//!
//! - **Retry** with exponential backoff (`retry.rs`)
//! - **Circuit breaker** that fails fast after repeated failures
//!   (`circuit_breaker.rs`)
//! - **[`ResilientTransport`]**, a [`Transport`](rpcwire_traits::Transport)
//!   wrapper combining both with bounded reconnection (`transport.rs`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rpcwire_transport::resilience::{ResilienceConfig, ResilientTransport};
//! use rpcwire_transport::{StdioTransport, Transport};
//!
//! let inner = Arc::new(StdioTransport::stdio());
//! let resilient = ResilientTransport::new(inner, ResilienceConfig::default());
//! resilient.start().await?;
//! resilient.send_with_retry(message).await?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod circuit_breaker;
pub mod retry;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::ExponentialBackoff;
pub use transport::{ResilienceStats, ResilientTransport};

/// Settings for [`ResilientTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Total send attempts per message, including the first
    pub max_retry_attempts: u32,
    /// Delay after the first failed attempt
    pub base_retry_delay: Duration,
    /// Upper bound on any retry delay
    pub max_retry_delay: Duration,
    /// Consecutive failures that open the circuit
    pub circuit_breaker_threshold: u32,
    /// Time the circuit stays open before a trial
    pub circuit_breaker_timeout: Duration,
    /// Reconnection attempts before giving up
    pub max_reconnection_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            max_reconnection_attempts: 5,
        }
    }
}

impl ResilienceConfig {
    /// Create a resilience configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// The retry delay schedule
    pub const fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_retry_delay, self.max_retry_delay)
    }

    /// The breaker settings
    pub const fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            timeout: self.circuit_breaker_timeout,
        }
    }
}
