//! ResilientTransport - retry, circuit breaking and bounded reconnection
//! around any [`Transport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use rpcwire_traits::{
    Clock, HealthReport, Message, MessageHandler, SystemClock, Transport, TransportConfig,
    TransportError, TransportResult, TransportStats, TransportType,
};

use super::ResilienceConfig;
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};

/// Counters exposed by [`ResilientTransport::stats_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceStats {
    /// Breaker state at snapshot time
    pub circuit_state: CircuitState,
    /// Consecutive failures recorded by the breaker
    pub failure_count: u32,
    /// Sends that eventually succeeded
    pub successful_operations: u64,
    /// Sends that failed after exhausting retries or on a non-retriable error
    pub failed_operations: u64,
    /// Retries performed after a failed attempt
    pub retry_attempts: u64,
    /// Sends rejected because the circuit was open
    pub circuit_rejections: u64,
    /// Reconnection attempts since the last reset
    pub reconnection_attempts: u32,
    /// Reconnections that succeeded
    pub successful_reconnections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    retry_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
    successful_reconnections: AtomicU64,
}

/// Wraps a transport with retry, a circuit breaker and bounded
/// reconnection.
///
/// `send` goes through [`send_with_retry`](Self::send_with_retry); every
/// other [`Transport`] method delegates to the inner transport.
#[derive(Debug)]
pub struct ResilientTransport {
    inner: Arc<dyn Transport>,
    config: ResilienceConfig,
    circuit_breaker: Mutex<CircuitBreaker>,
    reconnection_attempts: AtomicU32,
    counters: Counters,
}

impl ResilientTransport {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Transport>, config: ResilienceConfig) -> Self {
        Self::with_clock(inner, config, SystemClock::shared())
    }

    /// Wraps `inner`, timing the circuit breaker with `clock`.
    pub fn with_clock(
        inner: Arc<dyn Transport>,
        config: ResilienceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = CircuitBreaker::with_clock(config.circuit_breaker_config(), clock);
        Self {
            inner,
            config,
            circuit_breaker: Mutex::new(breaker),
            reconnection_attempts: AtomicU32::new(0),
            counters: Counters::default(),
        }
    }

    /// Wraps `inner` with default settings.
    pub fn with_defaults(inner: Arc<dyn Transport>) -> Self {
        Self::new(inner, ResilienceConfig::default())
    }

    /// The wrapped transport
    pub fn inner(&self) -> &Arc<dyn Transport> {
        &self.inner
    }

    /// Resilience settings
    pub const fn resilience_config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Current breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.lock().state()
    }

    /// Breaker statistics
    pub fn circuit_breaker_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.lock().statistics()
    }

    /// Sends `message`, retrying transient failures with exponential backoff.
    ///
    /// Makes at most `max_retry_attempts` attempts. An open circuit fails
    /// with [`TransportError::CircuitOpen`] before any I/O. Non-retriable
    /// errors are returned after the first attempt.
    pub async fn send_with_retry(&self, message: Message) -> TransportResult<()> {
        let max_attempts = self.config.max_retry_attempts.max(1);
        let backoff = self.config.backoff();

        let mut attempt = 1;
        loop {
            let Some(admission) = self.admit() else {
                debug!(attempt, "send rejected, circuit breaker is open");
                return Err(TransportError::CircuitOpen);
            };

            let result = self.inner.send(message.clone()).await;
            admission.finish(result.is_ok());

            match result {
                Ok(()) => {
                    self.counters
                        .successful_operations
                        .fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(attempt, "send succeeded after retry");
                    }
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    let delay = backoff.delay(attempt);
                    warn!(attempt, max_attempts, delay = ?delay, error = %e, "send failed, retrying");
                    self.counters.retry_attempts.fetch_add(1, Ordering::Relaxed);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.counters.failed_operations.fetch_add(1, Ordering::Relaxed);
                    warn!(attempt, error = %e, "send failed");
                    return Err(e);
                }
            }
        }
    }

    /// Asks the breaker to admit one operation, counting a rejection.
    fn admit(&self) -> Option<Admission<'_>> {
        if self.circuit_breaker.lock().should_allow_operation() {
            Some(Admission {
                breaker: &self.circuit_breaker,
                finished: false,
            })
        } else {
            self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Forces the circuit closed and clears its failure count.
    pub fn reset_circuit_breaker(&self) {
        self.circuit_breaker.lock().reset();
        info!("circuit breaker reset");
    }

    /// Reconnects the inner transport, backing off between attempts.
    ///
    /// Attempts are counted across calls and capped at
    /// `max_reconnection_attempts`; once exhausted this returns `false`
    /// without trying until [`reset_reconnection_attempts`](Self::reset_reconnection_attempts).
    /// A successful reconnection resets the count.
    pub async fn reconnect_with_backoff(&self) -> bool {
        let backoff = self.config.backoff();
        loop {
            let previous = self.reconnection_attempts.load(Ordering::Acquire);
            if previous >= self.config.max_reconnection_attempts {
                warn!(
                    attempts = previous,
                    "reconnection attempts exhausted"
                );
                return false;
            }
            if previous > 0 {
                sleep(backoff.delay(previous)).await;
            }
            let attempt = self.reconnection_attempts.fetch_add(1, Ordering::AcqRel) + 1;

            match self.inner.reconnect().await {
                Ok(()) => {
                    self.reconnection_attempts.store(0, Ordering::Release);
                    self.counters
                        .successful_reconnections
                        .fetch_add(1, Ordering::Relaxed);
                    info!(attempt, "reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnection failed");
                }
            }
        }
    }

    /// Allows `reconnect_with_backoff` to try again.
    pub fn reset_reconnection_attempts(&self) {
        self.reconnection_attempts.store(0, Ordering::Release);
    }

    /// Counter snapshot.
    pub fn stats_snapshot(&self) -> ResilienceStats {
        let mut breaker = self.circuit_breaker.lock();
        ResilienceStats {
            circuit_state: breaker.state(),
            failure_count: breaker.failure_count(),
            successful_operations: self.counters.successful_operations.load(Ordering::Relaxed),
            failed_operations: self.counters.failed_operations.load(Ordering::Relaxed),
            retry_attempts: self.counters.retry_attempts.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Relaxed),
            successful_reconnections: self
                .counters
                .successful_reconnections
                .load(Ordering::Relaxed),
        }
    }
}

/// An operation admitted by the breaker.
///
/// Dropped without [`finish`](Self::finish), as when the caller's future is
/// cancelled mid-send, it abandons the operation so a half-open trial is
/// never left in flight.
struct Admission<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    finished: bool,
}

impl Admission<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker.lock().record_result(success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.lock().abandon_operation();
        }
    }
}

#[async_trait]
impl Transport for ResilientTransport {
    fn transport_type(&self) -> TransportType {
        self.inner.transport_type()
    }

    fn initialize(&self, config: TransportConfig) -> TransportResult<()> {
        self.inner.initialize(config)
    }

    async fn start(&self) -> TransportResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> TransportResult<()> {
        self.inner.stop().await
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        self.send_with_retry(message).await
    }

    async fn send_batch(&self, messages: Vec<Message>) -> TransportResult<()> {
        let Some(admission) = self.admit() else {
            return Err(TransportError::CircuitOpen);
        };
        let result = self.inner.send_batch(messages).await;
        admission.finish(result.is_ok());
        result
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        self.inner.receive().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn config(&self) -> TransportConfig {
        self.inner.config()
    }

    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.set_message_handler(handler);
    }

    async fn health_check(&self) -> HealthReport {
        let report = self.inner.health_check().await;
        let circuit_ok = self.circuit_state() != CircuitState::Open;
        HealthReport::from_checks(
            report
                .checks
                .into_iter()
                .chain(std::iter::once(("circuit_breaker".to_string(), circuit_ok))),
        )
    }

    async fn reconnect(&self) -> TransportResult<()> {
        if self.reconnect_with_backoff().await {
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed(format!(
                "gave up after {} reconnection attempts",
                self.config.max_reconnection_attempts
            )))
        }
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats()
    }

    fn endpoint(&self) -> Option<String> {
        self.inner.endpoint()
    }
}
