//! Transport metrics types.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A serializable snapshot of a transport's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Messages handed to the transport for sending.
    pub messages_sent: u64,

    /// Messages received and dispatched.
    pub messages_received: u64,

    /// Errors observed while sending, receiving or handling.
    pub errors_count: u64,

    /// `start`/`stop` calls that found the transport already in the target state.
    pub redundant_transitions: u64,
}

/// A lock-free, atomic structure for high-performance metrics updates.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    /// Total messages sent (atomic counter).
    pub messages_sent: AtomicU64,

    /// Total messages received (atomic counter).
    pub messages_received: AtomicU64,

    /// Total errors (atomic counter).
    pub errors_count: AtomicU64,

    /// Idempotent lifecycle calls (atomic counter).
    pub redundant_transitions: AtomicU64,
}

impl AtomicMetrics {
    /// Creates a new `AtomicMetrics` instance with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sent message.
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one received message.
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one error.
    pub fn record_error(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a no-op lifecycle call.
    pub fn record_redundant_transition(&self) {
        self.redundant_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Creates a serializable `TransportStats` snapshot from the current atomic values.
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
            redundant_transitions: self.redundant_transitions.load(Ordering::Relaxed),
        }
    }

    /// Resets all atomic metric counters to zero.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.errors_count.store(0, Ordering::Relaxed);
        self.redundant_transitions.store(0, Ordering::Relaxed);
    }
}

/// Destination for counters and gauges emitted by transports.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Adds `value` to the counter `name`.
    fn increment_counter(&self, name: &'static str, value: u64);

    /// Sets the gauge `name`.
    fn record_gauge(&self, name: &'static str, value: f64);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment_counter(&self, _name: &'static str, _value: u64) {}

    fn record_gauge(&self, _name: &'static str, _value: f64) {}
}

/// Forwards to the global `metrics` recorder.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCrateSink;

#[cfg(feature = "metrics")]
impl MetricsSink for MetricsCrateSink {
    fn increment_counter(&self, name: &'static str, value: u64) {
        metrics::counter!(name).increment(value);
    }

    fn record_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_metrics_default() {
        let metrics = AtomicMetrics::new();
        assert_eq!(metrics.snapshot(), TransportStats::default());
    }

    #[test]
    fn test_atomic_metrics_update() {
        let metrics = AtomicMetrics::new();
        metrics.record_sent();
        metrics.record_sent();
        metrics.record_received();
        metrics.record_error();
        metrics.record_redundant_transition();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.errors_count, 1);
        assert_eq!(snapshot.redundant_transitions, 1);
    }

    #[test]
    fn test_atomic_metrics_reset() {
        let metrics = AtomicMetrics::new();
        metrics.record_sent();
        metrics.reset();
        assert_eq!(metrics.snapshot().messages_sent, 0);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = TransportStats {
            messages_sent: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["messages_sent"], 3);
        assert_eq!(json["errors_count"], 0);
    }
}
