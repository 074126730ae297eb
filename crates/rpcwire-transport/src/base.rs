//! Shared transport lifecycle.
//!
//! [`BaseTransport`] implements [`Transport`] once for every backend: config
//! merging and validation, idempotent start/stop with exactly-once handler
//! callbacks, counters, health, retrying sends and uptime. A concrete
//! transport only supplies a [`TransportBackend`].
//!
//! # Interior Mutability Pattern
//!
//! - `parking_lot::RwLock` for state, config and handler (never held across `.await`)
//! - [`AtomicMetrics`] for lock-free counters
//! - `tokio::sync::Mutex` serializing lifecycle transitions (held across `.await`)

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, trace, warn};

use rpcwire_traits::{
    AtomicMetrics, Clock, ConfigProvider, Message, MessageHandler, MetricsSink, NoopMetricsSink,
    SystemClock, Transport, TransportConfig, TransportError, TransportResult, TransportState,
    TransportStats, TransportType, error_codes,
};

/// Marker substituted for sensitive config values in logs.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEY_PARTS: [&str; 4] = ["password", "token", "secret", "key"];

/// The type-specific half of a transport.
///
/// Backends use interior mutability; [`BaseTransport`] serializes calls to
/// `do_start`/`do_stop` and only calls `do_send`/`do_receive` while connected.
#[async_trait]
pub trait TransportBackend: Send + Sync + std::fmt::Debug + 'static {
    /// The transport type served by this backend.
    fn transport_type(&self) -> TransportType;

    /// Defaults that caller config is merged over.
    fn default_config(&self) -> TransportConfig {
        TransportConfig::defaults_for(self.transport_type())
    }

    /// Type-specific validation, run after the common checks.
    fn validate_config(&self, _config: &TransportConfig) -> TransportResult<()> {
        Ok(())
    }

    /// Acquires the backend's resources.
    async fn do_start(&self, config: &TransportConfig) -> TransportResult<()>;

    /// Releases the backend's resources.
    async fn do_stop(&self) -> TransportResult<()>;

    /// Sends one message.
    async fn do_send(&self, message: &Message) -> TransportResult<()>;

    /// Sends several messages in one operation. Defaults to one `do_send` each.
    async fn do_send_batch(&self, messages: &[Message]) -> TransportResult<()> {
        for message in messages {
            self.do_send(message).await?;
        }
        Ok(())
    }

    /// Receives one message, if available.
    async fn do_receive(&self) -> TransportResult<Option<Message>>;

    /// Address of the peer or listener, if meaningful.
    fn endpoint(&self, _config: &TransportConfig) -> Option<String> {
        None
    }
}

/// Generic transport built from a [`TransportBackend`].
pub struct BaseTransport<B: TransportBackend> {
    backend: B,
    config: RwLock<TransportConfig>,
    state: RwLock<TransportState>,
    connected_at: RwLock<Option<Instant>>,
    metrics: AtomicMetrics,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    clock: Arc<dyn Clock>,
    metrics_sink: Arc<dyn MetricsSink>,
    config_provider: Option<Arc<dyn ConfigProvider>>,
    lifecycle: TokioMutex<()>,
}

impl<B: TransportBackend> std::fmt::Debug for BaseTransport<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseTransport")
            .field("backend", &self.backend)
            .field("state", &*self.state.read())
            .field("config", &self.safe_config_for_logging())
            .field("metrics", &self.metrics)
            .field("handler", &self.handler.read().as_ref().map(|_| "<handler>"))
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<B: TransportBackend> BaseTransport<B> {
    /// Wraps `backend`, starting from its default config.
    pub fn new(backend: B) -> Self {
        let config = backend.default_config();
        Self {
            backend,
            config: RwLock::new(config),
            state: RwLock::new(TransportState::Disconnected),
            connected_at: RwLock::new(None),
            metrics: AtomicMetrics::new(),
            handler: RwLock::new(None),
            clock: SystemClock::shared(),
            metrics_sink: Arc::new(NoopMetricsSink),
            config_provider: None,
            lifecycle: TokioMutex::new(()),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the metrics sink.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    /// Sets the provider consulted by [`reload_config`](Self::reload_config).
    #[must_use]
    pub fn with_config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config_provider = Some(provider);
        self
    }

    /// The backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.state.read().clone()
    }

    /// The installed message handler, if any.
    pub fn message_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().clone()
    }

    /// Time since the last successful `start`, `None` while disconnected.
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at
            .read()
            .map(|since| self.clock.now().saturating_duration_since(since))
    }

    /// Config copy with sensitive values replaced by [`REDACTED`].
    ///
    /// A key is sensitive if it contains `password`, `token`, `secret` or
    /// `key` in any case.
    pub fn safe_config_for_logging(&self) -> TransportConfig {
        self.config
            .read()
            .iter()
            .map(|(key, value)| {
                let lowered = key.to_ascii_lowercase();
                if SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part)) {
                    (key.clone(), Value::String(REDACTED.to_string()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }

    /// Sends with up to `retry_attempts` extra attempts, `retry_delay` apart.
    ///
    /// Only retriable errors are retried; anything else is returned after
    /// the first attempt.
    ///
    /// # Errors
    ///
    /// The last failure once every attempt is used.
    pub async fn send_with_retry(&self, message: Message) -> TransportResult<()> {
        self.ensure_connected()?;
        let config = self.config();
        let attempts = config.retry_attempts().saturating_add(1);
        let delay = config.retry_delay();

        let mut attempt = 1;
        loop {
            match self.backend.do_send(&message).await {
                Ok(()) => {
                    self.record_sent(1);
                    return Ok(());
                }
                Err(e) if !e.is_retriable() || attempt >= attempts => {
                    self.record_error();
                    warn!(
                        transport = %self.backend.transport_type(),
                        attempt,
                        error = %e,
                        "send failed, giving up"
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        transport = %self.backend.transport_type(),
                        attempt,
                        error = %e,
                        "send failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Re-reads the config provider and layers its values over the current config.
    ///
    /// A no-op without a provider. An invalid result is rejected and the
    /// current config kept.
    pub fn reload_config(&self) -> TransportResult<()> {
        let Some(provider) = &self.config_provider else {
            debug!("no config provider, reload skipped");
            return Ok(());
        };
        let reloaded = self.config.read().merged_with(&provider.snapshot());
        self.apply_config(reloaded)?;
        info!(
            transport = %self.backend.transport_type(),
            config = ?self.safe_config_for_logging(),
            "configuration reloaded"
        );
        Ok(())
    }

    /// Runs the installed handler on one incoming message.
    ///
    /// A request the handler does not accept is answered with
    /// `Method not found`; declined notifications and responses are dropped
    /// with `Ok(None)`.
    /// Handler failures are reported through `handle_error` before being
    /// returned.
    pub(crate) async fn dispatch(&self, message: Message) -> TransportResult<Option<Message>> {
        self.metrics.record_received();
        self.metrics_sink
            .increment_counter("rpcwire_messages_received_total", 1);

        let handler = self.message_handler().ok_or_else(|| {
            TransportError::Handler("no message handler configured".to_string())
        })?;

        if !handler.can_handle(&message) {
            debug!(kind = message.kind(), "handler declined message");
            return Ok(declined_reply(message));
        }

        match handler.handle(message, self).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.record_error();
                handler.handle_error(&e, self).await;
                Err(e)
            }
        }
    }

    pub(crate) fn record_error(&self) {
        self.metrics.record_error();
        self.metrics_sink
            .increment_counter("rpcwire_transport_errors_total", 1);
    }

    pub(crate) fn record_sent(&self, count: u64) {
        for _ in 0..count {
            self.metrics.record_sent();
        }
        self.metrics_sink
            .increment_counter("rpcwire_messages_sent_total", count);
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed(format!(
                "{} transport is not connected",
                self.backend.transport_type()
            )))
        }
    }

    fn set_state(&self, new_state: TransportState) {
        let mut state = self.state.write();
        if *state != new_state {
            trace!(
                transport = %self.backend.transport_type(),
                "state: {} -> {}",
                *state,
                new_state
            );
            *state = new_state;
        }
    }

    fn apply_config(&self, config: TransportConfig) -> TransportResult<()> {
        config.validate()?;
        self.backend.validate_config(&config)?;
        *self.config.write() = config;
        Ok(())
    }
}

#[async_trait]
impl<B: TransportBackend> Transport for BaseTransport<B> {
    fn transport_type(&self) -> TransportType {
        self.backend.transport_type()
    }

    fn initialize(&self, config: TransportConfig) -> TransportResult<()> {
        let merged = self.backend.default_config().merged_with(&config);
        self.apply_config(merged).inspect_err(|e| {
            warn!(transport = %self.backend.transport_type(), error = %e, "invalid configuration");
        })?;
        debug!(
            transport = %self.backend.transport_type(),
            config = ?self.safe_config_for_logging(),
            "transport initialized"
        );
        Ok(())
    }

    async fn start(&self) -> TransportResult<()> {
        let _transition = self.lifecycle.lock().await;
        if self.is_connected() {
            self.metrics.record_redundant_transition();
            debug!(transport = %self.backend.transport_type(), "already started");
            return Ok(());
        }

        self.set_state(TransportState::Connecting);
        let config = self.config();
        if let Err(e) = self.backend.do_start(&config).await {
            self.record_error();
            self.set_state(TransportState::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        *self.connected_at.write() = Some(self.clock.now());
        self.set_state(TransportState::Connected);
        self.metrics_sink
            .increment_counter("rpcwire_transport_starts_total", 1);
        info!(transport = %self.backend.transport_type(), "transport started");

        if let Some(handler) = self.message_handler() {
            handler.on_connect(self).await;
        }
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let _transition = self.lifecycle.lock().await;
        if !self.is_connected() {
            self.metrics.record_redundant_transition();
            debug!(transport = %self.backend.transport_type(), "already stopped");
            return Ok(());
        }

        self.set_state(TransportState::Disconnecting);
        let result = self.backend.do_stop().await;
        if let Err(e) = &result {
            self.record_error();
            warn!(transport = %self.backend.transport_type(), error = %e, "error while stopping");
        }

        *self.connected_at.write() = None;
        self.set_state(TransportState::Disconnected);
        info!(transport = %self.backend.transport_type(), "transport stopped");

        if let Some(handler) = self.message_handler() {
            handler.on_disconnect(self).await;
        }
        result
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        self.ensure_connected()?;
        match self.backend.do_send(&message).await {
            Ok(()) => {
                self.record_sent(1);
                Ok(())
            }
            Err(e) => {
                self.record_error();
                Err(e)
            }
        }
    }

    async fn send_batch(&self, messages: Vec<Message>) -> TransportResult<()> {
        self.ensure_connected()?;
        if messages.is_empty() {
            return Ok(());
        }
        match self.backend.do_send_batch(&messages).await {
            Ok(()) => {
                self.record_sent(messages.len() as u64);
                Ok(())
            }
            Err(e) => {
                self.record_error();
                Err(e)
            }
        }
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        self.ensure_connected()?;
        match self.backend.do_receive().await {
            Ok(Some(message)) => {
                self.metrics.record_received();
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.record_error();
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state.read(), TransportState::Connected)
    }

    fn config(&self) -> TransportConfig {
        self.config.read().clone()
    }

    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn stats(&self) -> TransportStats {
        self.metrics.snapshot()
    }

    fn endpoint(&self) -> Option<String> {
        self.backend.endpoint(&self.config.read())
    }
}

/// The reply owed for a message the handler declined.
fn declined_reply(message: Message) -> Option<Message> {
    if !message.is_request() {
        return None;
    }
    let method = message.method.unwrap_or_default();
    let id = message.id?;
    Some(Message::error_response(
        error_codes::METHOD_NOT_FOUND,
        "Method not found",
        Some(serde_json::json!({ "method": method })),
        id,
    ))
}
