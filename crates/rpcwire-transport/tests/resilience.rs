//! Circuit breaking, retry and reconnection through `ResilientTransport`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedTransport, notification};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rpcwire_transport::resilience::CircuitState;
use rpcwire_transport::{
    ManualClock, ResilienceConfig, ResilientTransport, Transport, TransportError,
};

/// Single-attempt sends so every failure reaches the breaker exactly once.
fn breaker_only(threshold: u32) -> ResilienceConfig {
    ResilienceConfig {
        max_retry_attempts: 1,
        circuit_breaker_threshold: threshold,
        circuit_breaker_timeout: Duration::from_secs(10),
        ..ResilienceConfig::default()
    }
}

fn wrap(
    inner: &Arc<ScriptedTransport>,
    config: ResilienceConfig,
) -> (ResilientTransport, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let transport = ResilientTransport::with_clock(inner.clone(), config, clock.clone());
    (transport, clock)
}

#[tokio::test]
async fn open_circuit_short_circuits_until_trial() {
    let inner = ScriptedTransport::failing(3);
    let (transport, clock) = wrap(&inner, breaker_only(3));

    for _ in 0..3 {
        let err = transport.send(notification(0)).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }
    assert_eq!(transport.circuit_state(), CircuitState::Open);
    assert_eq!(inner.send_calls(), 3);

    // open: rejected without touching the inner transport
    let err = transport.send(notification(1)).await.unwrap_err();
    assert_eq!(err, TransportError::CircuitOpen);
    assert_eq!(inner.send_calls(), 3);
    assert!(!transport.health_check().await.healthy);

    clock.advance(Duration::from_secs(10));
    assert_eq!(transport.circuit_state(), CircuitState::HalfOpen);

    // the half-open trial succeeds and closes the circuit
    transport.send(notification(2)).await.unwrap();
    assert_eq!(inner.send_calls(), 4);
    assert_eq!(transport.circuit_state(), CircuitState::Closed);
    assert_eq!(transport.circuit_breaker_stats().failure_count, 0);

    let stats = transport.stats_snapshot();
    assert_eq!(stats.failed_operations, 3);
    assert_eq!(stats.successful_operations, 1);
    assert_eq!(stats.circuit_rejections, 1);
}

#[tokio::test]
async fn failed_trial_reopens_circuit() {
    let inner = ScriptedTransport::failing(2);
    let (transport, clock) = wrap(&inner, breaker_only(1));

    assert!(transport.send(notification(0)).await.is_err());
    assert_eq!(transport.circuit_state(), CircuitState::Open);

    clock.advance(Duration::from_secs(10));
    assert!(matches!(
        transport.send(notification(1)).await,
        Err(TransportError::SendFailed(_))
    ));
    assert_eq!(transport.circuit_state(), CircuitState::Open);
    assert_eq!(transport.circuit_breaker_stats().total_trips, 2);

    // timer restarted by the failed trial
    clock.advance(Duration::from_secs(9));
    assert_eq!(
        transport.send(notification(2)).await,
        Err(TransportError::CircuitOpen)
    );
    assert_eq!(inner.send_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_trial_does_not_wedge_half_open() {
    let inner = ScriptedTransport::failing(1);
    let (transport, clock) = wrap(&inner, breaker_only(1));

    assert!(transport.send(notification(0)).await.is_err());
    clock.advance(Duration::from_secs(10));

    // the trial hangs and the caller gives up on it
    inner.set_stalled(true);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), transport.send(notification(1))).await;
    assert!(abandoned.is_err());
    assert_eq!(inner.send_calls(), 2);
    assert_eq!(transport.circuit_state(), CircuitState::Open);

    inner.set_stalled(false);
    clock.advance(Duration::from_secs(10));
    transport.send(notification(2)).await.unwrap();
    assert_eq!(inner.send_calls(), 3);
    assert_eq!(transport.circuit_state(), CircuitState::Closed);
    assert_eq!(inner.delivered(), vec![notification(2)]);
}

#[tokio::test]
async fn batch_sends_respect_the_breaker() {
    let inner = ScriptedTransport::new();
    inner.set_fail_batches(true);
    let (transport, _clock) = wrap(&inner, breaker_only(2));

    for _ in 0..2 {
        assert!(
            transport
                .send_batch(vec![notification(0), notification(1)])
                .await
                .is_err()
        );
    }
    assert_eq!(
        transport.send_batch(vec![notification(2)]).await,
        Err(TransportError::CircuitOpen)
    );
    assert!(inner.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_on_last_attempt_with_backoff() {
    let inner = ScriptedTransport::failing(2);
    let config = ResilienceConfig {
        max_retry_attempts: 3,
        base_retry_delay: Duration::from_millis(100),
        circuit_breaker_threshold: 10,
        ..ResilienceConfig::default()
    };
    let (transport, _clock) = wrap(&inner, config);

    let started = tokio::time::Instant::now();
    transport.send(notification(7)).await.unwrap();

    assert_eq!(inner.send_calls(), 3);
    assert_eq!(inner.delivered(), vec![notification(7)]);
    // 100ms then 200ms
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(transport.stats_snapshot().retry_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_max_attempts() {
    let inner = ScriptedTransport::failing(5);
    let config = ResilienceConfig {
        max_retry_attempts: 3,
        circuit_breaker_threshold: 10,
        ..ResilienceConfig::default()
    };
    let (transport, _clock) = wrap(&inner, config);

    assert!(transport.send(notification(0)).await.is_err());
    assert_eq!(inner.send_calls(), 3);
    assert!(inner.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnection_is_bounded() {
    let inner = ScriptedTransport::new();
    let config = ResilienceConfig {
        max_reconnection_attempts: 2,
        ..ResilienceConfig::default()
    };
    let (transport, _clock) = wrap(&inner, config);

    assert!(transport.reconnect_with_backoff().await);
    assert_eq!(transport.stats_snapshot().successful_reconnections, 1);
    assert_eq!(transport.stats_snapshot().reconnection_attempts, 0);
    assert!(transport.reconnect().await.is_ok());
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: the circuit opens after exactly `threshold` consecutive
    /// failures, after which sends never reach the inner transport
    #[test]
    fn prop_circuit_opens_at_threshold(threshold in 1u32..8, extra in 1u32..5) {
        runtime().block_on(async {
            let inner = ScriptedTransport::failing(u32::MAX);
            let (transport, _clock) = wrap(&inner, breaker_only(threshold));

            for n in 0..threshold {
                prop_assert_eq!(transport.circuit_state(), CircuitState::Closed);
                prop_assert!(transport.send(notification(n as usize)).await.is_err());
            }
            prop_assert_eq!(transport.circuit_state(), CircuitState::Open);

            for _ in 0..extra {
                prop_assert_eq!(
                    transport.send(notification(0)).await,
                    Err(TransportError::CircuitOpen)
                );
            }
            prop_assert_eq!(inner.send_calls(), threshold);
            Ok(())
        })?;
    }

    /// Property: with R attempts, a send that fails R-1 times makes exactly R calls
    #[test]
    fn prop_retry_uses_exactly_r_attempts(attempts in 1u32..6) {
        runtime().block_on(async {
            let inner = ScriptedTransport::failing(attempts - 1);
            let config = ResilienceConfig {
                max_retry_attempts: attempts,
                circuit_breaker_threshold: 100,
                ..ResilienceConfig::default()
            };
            let (transport, _clock) = wrap(&inner, config);

            prop_assert!(transport.send(notification(0)).await.is_ok());
            prop_assert_eq!(inner.send_calls(), attempts);
            Ok(())
        })?;
    }
}
