//! Flush sizes, timeouts and fallback of `MessageBatcher`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedTransport, notification};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rpcwire_transport::{BatchConfig, ManualClock, MessageBatcher};

fn batcher(
    inner: &Arc<ScriptedTransport>,
    batch_size: usize,
) -> (MessageBatcher, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let config = BatchConfig {
        batch_size,
        batch_timeout: Duration::from_millis(100),
    };
    let batcher = MessageBatcher::with_config(inner.clone(), config)
        .unwrap()
        .with_clock(clock.clone());
    (batcher, clock)
}

/// Expected flush sizes for `total` messages in batches of `size`.
fn expected_batches(total: usize, size: usize) -> Vec<usize> {
    let mut sizes = vec![size; total / size];
    if total % size > 0 {
        sizes.push(total % size);
    }
    sizes
}

#[tokio::test]
async fn full_batches_flush_and_remainder_waits() {
    let inner = ScriptedTransport::new();
    let (batcher, _clock) = batcher(&inner, 3);

    for n in 0..7 {
        batcher.add_to_batch(notification(n)).await.unwrap();
    }
    assert_eq!(inner.batches(), vec![3, 3]);
    assert_eq!(batcher.pending_count().await, 1);

    assert_eq!(batcher.flush_batch().await.unwrap(), 1);
    assert_eq!(inner.batches(), vec![3, 3, 1]);
    assert_eq!(
        inner.delivered(),
        (0..7).map(notification).collect::<Vec<_>>()
    );

    let stats = batcher.get_batch_stats();
    assert_eq!(stats.batches_processed, 3);
    assert_eq!(stats.total_batched_messages, 7);
    assert!((stats.avg_batch_size - 7.0 / 3.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn timeout_flushes_only_after_it_has_passed() {
    let inner = ScriptedTransport::new();
    let (batcher, clock) = batcher(&inner, 10);

    assert!(!batcher.check_batch_timeout().await.unwrap());
    batcher.add_to_batch(notification(0)).await.unwrap();
    batcher.add_to_batch(notification(1)).await.unwrap();

    clock.advance(Duration::from_millis(100));
    assert!(!batcher.check_batch_timeout().await.unwrap());

    clock.advance(Duration::from_millis(1));
    assert!(batcher.check_batch_timeout().await.unwrap());
    assert_eq!(inner.batches(), vec![2]);
    assert_eq!(batcher.pending_count().await, 0);
}

#[tokio::test]
async fn failed_bulk_send_falls_back_to_individual_sends() {
    let inner = ScriptedTransport::new();
    inner.set_fail_batches(true);
    let (batcher, _clock) = batcher(&inner, 2);

    batcher.add_to_batch(notification(0)).await.unwrap();
    batcher.add_to_batch(notification(1)).await.unwrap();

    assert!(inner.batches().is_empty());
    assert_eq!(inner.send_calls(), 2);
    assert_eq!(inner.delivered(), vec![notification(0), notification(1)]);
    assert_eq!(batcher.get_batch_stats().fallback_flushes, 1);
}

#[tokio::test]
async fn disabled_batcher_sends_immediately() {
    let inner = ScriptedTransport::new();
    let batcher = MessageBatcher::new(inner.clone());
    assert!(!batcher.is_enabled());

    batcher.add_to_batch(notification(0)).await.unwrap();
    assert_eq!(inner.send_calls(), 1);
    assert!(inner.batches().is_empty());

    batcher
        .enable_batching(BatchConfig {
            batch_size: 2,
            batch_timeout: Duration::from_millis(50),
        })
        .await
        .unwrap();
    batcher.add_to_batch(notification(1)).await.unwrap();
    assert_eq!(batcher.pending_count().await, 1);

    // disabling drains what is queued
    batcher.disable_batching().await.unwrap();
    assert_eq!(inner.batches(), vec![1]);
    assert!(!batcher.is_enabled());
}

#[test]
fn zero_batch_size_is_rejected() {
    let config = BatchConfig {
        batch_size: 0,
        ..BatchConfig::default()
    };
    assert!(MessageBatcher::with_config(ScriptedTransport::new(), config).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: B messages with batch size S flush ceil(B/S) times, every
    /// flush holding S messages except possibly the last
    #[test]
    fn prop_flush_sizes(total in 0usize..60, size in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let inner = ScriptedTransport::new();
            let (batcher, _clock) = batcher(&inner, size);

            for n in 0..total {
                batcher.add_to_batch(notification(n)).await.unwrap();
            }
            batcher.flush_batch().await.unwrap();

            prop_assert_eq!(inner.batches(), expected_batches(total, size));
            prop_assert_eq!(inner.batches().len(), total.div_ceil(size));
            prop_assert_eq!(inner.delivered().len(), total);
            Ok(())
        })?;
    }
}
