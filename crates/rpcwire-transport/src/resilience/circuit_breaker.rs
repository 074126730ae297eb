//! Circuit breaker state machine.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(timeout elapsed)--> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)--> Open
//! ```
//!
//! Half-open admits exactly one trial operation; further operations are
//! rejected until that trial's result is recorded. A trial abandoned before
//! it reports counts as a failed trial.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use rpcwire_traits::{Clock, SystemClock};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Failing fast
    Open,
    /// One trial permitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Times the circuit has opened
    pub total_trips: u64,
    /// Time since the most recent failure that opened the circuit
    pub since_last_failure: Option<Duration>,
    /// Time spent in the current state
    pub time_in_current_state: Duration,
}

/// Circuit breaker implementation
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    total_trips: u64,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    trial_in_flight: bool,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a circuit breaker driven by `clock`
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            state: CircuitState::Closed,
            failure_count: 0,
            total_trips: 0,
            last_failure_time: None,
            last_state_change: now,
            trial_in_flight: false,
            clock,
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Whether an operation may proceed now.
    ///
    /// In half-open state the first caller claims the single trial.
    pub fn should_allow_operation(&mut self) -> bool {
        self.update_state();

        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record the outcome of an admitted operation
    pub fn record_result(&mut self, success: bool) {
        match self.state {
            CircuitState::Closed => {
                if success {
                    self.failure_count = 0;
                } else {
                    self.failure_count += 1;
                    if self.failure_count >= self.config.failure_threshold {
                        self.trip_circuit();
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.close_circuit();
                } else {
                    self.trip_circuit();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Give up an admitted operation without an outcome.
    ///
    /// An abandoned half-open trial reopens the circuit so the next trial
    /// is admitted after another timeout. Closed-state operations are not
    /// counted.
    pub fn abandon_operation(&mut self) {
        if self.state == CircuitState::HalfOpen && self.trial_in_flight {
            debug!("half-open trial abandoned");
            self.trip_circuit();
        }
    }

    /// Current state, after applying any elapsed timeout
    pub fn state(&mut self) -> CircuitState {
        self.update_state();
        self.state
    }

    /// Consecutive failures while closed
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Get circuit breaker statistics
    pub fn statistics(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        CircuitBreakerStats {
            state: self.state,
            failure_count: self.failure_count,
            total_trips: self.total_trips,
            since_last_failure: self
                .last_failure_time
                .map(|t| now.saturating_duration_since(t)),
            time_in_current_state: now.saturating_duration_since(self.last_state_change),
        }
    }

    /// Force the circuit closed and forget failures
    pub fn reset(&mut self) {
        self.close_circuit();
        self.last_failure_time = None;
    }

    /// Open the circuit now
    pub fn trip_circuit(&mut self) {
        let now = self.clock.now();
        warn!(
            failures = self.failure_count,
            timeout = ?self.config.timeout,
            "circuit breaker opened"
        );
        self.state = CircuitState::Open;
        self.last_failure_time = Some(now);
        self.last_state_change = now;
        self.trial_in_flight = false;
        self.total_trips += 1;
    }

    /// Close the circuit now
    pub fn close_circuit(&mut self) {
        if self.state != CircuitState::Closed {
            debug!(from = %self.state, "circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.last_state_change = self.clock.now();
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    /// Move from open to half-open once the timeout has elapsed
    pub fn update_state(&mut self) {
        if self.state != CircuitState::Open {
            return;
        }
        let now = self.clock.now();
        let opened_at = self.last_failure_time.unwrap_or(self.last_state_change);
        if now.saturating_duration_since(opened_at) >= self.config.timeout {
            debug!("circuit breaker half-open");
            self.state = CircuitState::HalfOpen;
            self.last_state_change = now;
            self.trial_in_flight = false;
        }
    }
}
