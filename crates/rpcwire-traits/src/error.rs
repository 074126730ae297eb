//! Transport error types.

use std::time::Duration;
use thiserror::Error;

use crate::message::error_codes;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
///
/// The variants fall into five families:
///
/// | Family | Variants | Recovery |
/// |--------|----------|----------|
/// | Configuration | [`ConfigurationError`](Self::ConfigurationError) | fatal, surfaced at `initialize` |
/// | Protocol | [`ProtocolError`](Self::ProtocolError), [`BufferOverflow`](Self::BufferOverflow), [`SerializationFailed`](Self::SerializationFailed) | per-message skip, overflow is fatal |
/// | Connection | [`ConnectionFailed`](Self::ConnectionFailed), [`ConnectionLost`](Self::ConnectionLost), [`SendFailed`](Self::SendFailed), [`ReceiveFailed`](Self::ReceiveFailed), [`Timeout`](Self::Timeout), [`Io`](Self::Io) | retried with backoff |
/// | Circuit | [`CircuitOpen`](Self::CircuitOpen) | fast fail, no I/O attempted |
/// | Handler | [`Handler`](Self::Handler) | reported via `handle_error`, turned into a `-32603` response |
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection, or the transport is not connected.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to send a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a message.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The message envelope or framing violated JSON-RPC 2.0.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A read buffer grew past its limit without a complete message boundary.
    #[error("Buffer overflow: {size} bytes buffered exceeds maximum of {max} bytes")]
    BufferOverflow {
        /// Bytes currently buffered
        size: usize,
        /// The configured maximum
        max: usize,
    },

    /// The operation did not complete within the specified timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The circuit breaker is open and the operation was rejected without I/O.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The application message handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The requested transport is not available.
    #[error("Transport not available: {0}")]
    NotAvailable(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Returns `true` for transient conditions that a retry may resolve.
    ///
    /// Structural errors (configuration, protocol, overflow) and circuit-open
    /// rejections are never retriable.
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::SendFailed(_)
                | Self::ReceiveFailed(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` if the error must terminate the session.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BufferOverflow { .. } | Self::ConfigurationError(_)
        )
    }

    /// The JSON-RPC error code used when this error is reported to a peer.
    pub const fn json_rpc_code(&self) -> i64 {
        match self {
            Self::SerializationFailed(_) | Self::BufferOverflow { .. } => error_codes::PARSE_ERROR,
            Self::ProtocolError(_) => error_codes::INVALID_REQUEST,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Self::ConnectionLost(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
