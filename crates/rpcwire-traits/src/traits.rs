//! Core transport traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::message::Message;
use crate::metrics::TransportStats;
use crate::types::{HealthReport, TransportType};

/// The core trait for all transport implementations.
///
/// A transport moves [`Message`]s between this process and a peer. Lifecycle
/// calls are idempotent: `start` on a connected transport and `stop` on a
/// stopped one succeed without side effects.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Returns the type of this transport.
    fn transport_type(&self) -> TransportType;

    /// Merges `config` over the transport's defaults and validates the result.
    ///
    /// Returns [`TransportError::ConfigurationError`] if the merged config is invalid.
    fn initialize(&self, config: TransportConfig) -> TransportResult<()>;

    /// Opens the underlying resources and marks the transport connected.
    async fn start(&self) -> TransportResult<()>;

    /// Releases the underlying resources and marks the transport disconnected.
    async fn stop(&self) -> TransportResult<()>;

    /// Sends a single message.
    ///
    /// Returns [`TransportError::ConnectionFailed`] when not connected.
    async fn send(&self, message: Message) -> TransportResult<()>;

    /// Receives the next message, or `None` if none is available.
    async fn receive(&self) -> TransportResult<Option<Message>>;

    /// Returns `true` if the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// The effective configuration.
    fn config(&self) -> TransportConfig;

    /// Installs the handler that incoming messages are dispatched to.
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>);

    /// Sends messages in order. Stops at the first failure.
    async fn send_batch(&self, messages: Vec<Message>) -> TransportResult<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Reports connectivity and configuration validity.
    async fn health_check(&self) -> HealthReport {
        HealthReport::from_checks([
            ("connectivity", self.is_connected()),
            ("configuration", self.config().validate().is_ok()),
        ])
    }

    /// Stops then starts the transport.
    async fn reconnect(&self) -> TransportResult<()> {
        self.stop().await?;
        self.start().await
    }

    /// Closes the transport. Equivalent to `stop`.
    async fn close(&self) -> TransportResult<()> {
        self.stop().await
    }

    /// A snapshot of the transport's counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }

    /// Returns the endpoint address, if any.
    fn endpoint(&self) -> Option<String> {
        None
    }
}

/// Application-side processor of incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message. `Some` is sent back to the peer.
    async fn handle(
        &self,
        message: Message,
        transport: &dyn Transport,
    ) -> TransportResult<Option<Message>>;

    /// Called when processing fails.
    async fn handle_error(&self, error: &TransportError, transport: &dyn Transport) {
        tracing::error!(
            transport = %transport.transport_type(),
            error = %error,
            "message handling failed"
        );
    }

    /// Called once when the transport connects.
    async fn on_connect(&self, _transport: &dyn Transport) {}

    /// Called once when the transport disconnects.
    async fn on_disconnect(&self, _transport: &dyn Transport) {}

    /// Whether this handler accepts `message`.
    fn can_handle(&self, message: &Message) -> bool {
        message.is_request() || message.is_notification()
    }

    /// The message kinds this handler accepts.
    fn supported_message_types(&self) -> Vec<&'static str> {
        vec!["request", "notification"]
    }
}

/// A factory for creating instances of a specific transport type.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Returns the type of transport this factory creates.
    fn transport_type(&self) -> TransportType;

    /// Creates and initializes a new transport instance with the given configuration.
    fn create(&self, config: TransportConfig) -> TransportResult<Box<dyn Transport>>;

    /// Returns `true` if this transport type is available on the current system.
    fn is_available(&self) -> bool {
        true
    }
}
