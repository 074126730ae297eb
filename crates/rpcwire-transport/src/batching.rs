//! Outgoing message batching.
//!
//! [`MessageBatcher`] queues messages and hands them to
//! [`Transport::send_batch`] in groups of up to `batch_size`. A group is
//! flushed when it fills, when [`MessageBatcher::check_batch_timeout`] finds
//! its oldest message has waited longer than `batch_timeout`, or on demand.
//! If the bulk send fails, each message is retried individually.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, trace, warn};

use rpcwire_traits::{
    Clock, Message, SystemClock, Transport, TransportError, TransportResult,
};

/// Batching settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Messages per flush; must be greater than zero
    pub batch_size: usize,
    /// Longest time a queued message waits before a timeout flush
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    /// Rejects a zero batch size.
    pub fn validate(&self) -> TransportResult<()> {
        if self.batch_size == 0 {
            return Err(TransportError::ConfigurationError(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batching counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Flushes that delivered at least one message
    pub batches_processed: u64,
    /// Messages delivered through flushes
    pub total_batched_messages: u64,
    /// `total_batched_messages / batches_processed`
    pub avg_batch_size: f64,
    /// Flushes that fell back to individual sends
    pub fallback_flushes: u64,
    /// Messages a flush could not deliver
    pub failed_messages: u64,
}

#[derive(Debug, Default)]
struct BatchBuffer {
    config: Option<BatchConfig>,
    messages: Vec<Message>,
    oldest: Option<Instant>,
}

impl BatchBuffer {
    fn take(&mut self) -> Vec<Message> {
        self.oldest = None;
        std::mem::take(&mut self.messages)
    }
}

/// Groups outgoing messages into bulk sends.
#[derive(Debug)]
pub struct MessageBatcher {
    transport: Arc<dyn Transport>,
    // held across sends so flushes never interleave
    buffer: TokioMutex<BatchBuffer>,
    enabled: AtomicBool,
    stats: Mutex<BatchStats>,
    clock: Arc<dyn Clock>,
}

impl MessageBatcher {
    /// A batcher over `transport`, with batching disabled.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            buffer: TokioMutex::new(BatchBuffer::default()),
            enabled: AtomicBool::new(false),
            stats: Mutex::new(BatchStats::default()),
            clock: SystemClock::shared(),
        }
    }

    /// A batcher with batching enabled.
    pub fn with_config(transport: Arc<dyn Transport>, config: BatchConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self {
            buffer: TokioMutex::new(BatchBuffer {
                config: Some(config),
                ..BatchBuffer::default()
            }),
            enabled: AtomicBool::new(true),
            ..Self::new(transport)
        })
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether messages are being queued.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of queued messages.
    pub async fn pending_count(&self) -> usize {
        self.buffer.lock().await.messages.len()
    }

    /// Starts queueing with `config`. Messages already queued stay queued.
    pub async fn enable_batching(&self, config: BatchConfig) -> TransportResult<()> {
        config.validate()?;
        let mut buffer = self.buffer.lock().await;
        debug!(
            batch_size = config.batch_size,
            batch_timeout = ?config.batch_timeout,
            "batching enabled"
        );
        let full = buffer.messages.len() >= config.batch_size;
        buffer.config = Some(config);
        self.enabled.store(true, Ordering::Release);
        if full {
            self.flush_locked(&mut buffer).await?;
        }
        Ok(())
    }

    /// Flushes anything queued, then sends messages immediately.
    pub async fn disable_batching(&self) -> TransportResult<()> {
        let mut buffer = self.buffer.lock().await;
        buffer.config = None;
        self.enabled.store(false, Ordering::Release);
        debug!(pending = buffer.messages.len(), "batching disabled");
        self.flush_locked(&mut buffer).await.map(|_| ())
    }

    /// Queues `message`, or sends it at once if batching is disabled.
    ///
    /// Flushes when the queue reaches `batch_size`.
    pub async fn add_to_batch(&self, message: Message) -> TransportResult<()> {
        let mut buffer = self.buffer.lock().await;
        let Some(batch_size) = buffer.config.as_ref().map(|c| c.batch_size) else {
            return self.transport.send(message).await;
        };

        if buffer.oldest.is_none() {
            buffer.oldest = Some(self.clock.now());
        }
        buffer.messages.push(message);
        trace!(pending = buffer.messages.len(), batch_size, "message queued");

        if buffer.messages.len() >= batch_size {
            self.flush_locked(&mut buffer).await?;
        }
        Ok(())
    }

    /// Flushes if the oldest queued message has waited longer than
    /// `batch_timeout`. Returns whether a flush happened.
    pub async fn check_batch_timeout(&self) -> TransportResult<bool> {
        let mut buffer = self.buffer.lock().await;
        let (Some(config), Some(oldest)) = (buffer.config.as_ref(), buffer.oldest) else {
            return Ok(false);
        };
        let waited = self.clock.now().saturating_duration_since(oldest);
        if waited <= config.batch_timeout {
            return Ok(false);
        }
        debug!(waited = ?waited, "batch timeout reached");
        self.flush_locked(&mut buffer).await?;
        Ok(true)
    }

    /// Sends everything queued as one bulk operation. Returns the number of
    /// messages flushed.
    pub async fn flush_batch(&self) -> TransportResult<usize> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    /// Counter snapshot.
    pub fn get_batch_stats(&self) -> BatchStats {
        self.stats.lock().clone()
    }

    async fn flush_locked(&self, buffer: &mut BatchBuffer) -> TransportResult<usize> {
        let messages = buffer.take();
        let count = messages.len();
        if count == 0 {
            return Ok(0);
        }

        let bulk = self.transport.send_batch(messages.clone()).await;
        let (delivered, result) = match bulk {
            Ok(()) => (count, Ok(())),
            Err(e) => {
                warn!(count, error = %e, "bulk send failed, sending individually");
                self.stats.lock().fallback_flushes += 1;
                self.send_individually(messages).await
            }
        };

        {
            let mut stats = self.stats.lock();
            stats.failed_messages += (count - delivered) as u64;
            if delivered > 0 {
                stats.batches_processed += 1;
                stats.total_batched_messages += delivered as u64;
                stats.avg_batch_size =
                    stats.total_batched_messages as f64 / stats.batches_processed as f64;
            }
        }
        trace!(count, delivered, "batch flushed");
        result.map(|()| count)
    }

    /// Sends one at a time, returning how many were delivered.
    async fn send_individually(&self, messages: Vec<Message>) -> (usize, TransportResult<()>) {
        let total = messages.len();
        let mut failed = 0usize;
        let mut first_error = None;
        for message in messages {
            if let Err(e) = self.transport.send(message).await {
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
        let result = match first_error {
            None => Ok(()),
            Some(e) => Err(TransportError::SendFailed(format!(
                "{failed} of {total} messages failed after bulk send fallback: {e}"
            ))),
        };
        (total - failed, result)
    }
}
