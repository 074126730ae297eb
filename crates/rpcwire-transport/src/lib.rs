//! # rpcwire transport
//!
//! JSON-RPC 2.0 transport layer: framing, byte streams, stdio and HTTP
//! transports, plus the capabilities that sit on top of any transport.
//!
//! ## Supported Transports
//!
//! - **STDIO**: long-lived stream on process stdin/stdout (or any async
//!   reader/writer pair), line-delimited or `Content-Length` framed
//! - **HTTP**: one POST per message, mounted on an axum router
//!
//! ## Capabilities
//!
//! - **Connection Pooling**: bounded keyed pools with LRU/FIFO/LIFO eviction
//!   and a factory-driven [`PooledTransportManager`]
//! - **Resilience**: circuit breaker, exponential backoff retry and bounded
//!   reconnection in [`resilience::ResilientTransport`]
//! - **Batching**: size- and time-bounded bulk sends in [`MessageBatcher`]
//!
//! ## Module Organization
//!
//! ```text
//! rpcwire-transport/
//! ├── framing      # MessageFramer, line and Content-Length codecs
//! ├── stream       # StreamHandler over stdin/stdout, files, raw streams
//! ├── base         # BaseTransport<B> lifecycle, metrics, dispatch
//! ├── stdio        # StdioTransport, listen loop, signal handling
//! ├── http         # HttpTransport, axum router, CORS
//! ├── pool         # ConnectionPool
//! ├── manager      # PooledTransportManager
//! ├── resilience/  # CircuitBreaker, backoff, ResilientTransport
//! ├── batching     # MessageBatcher
//! └── logging      # tracing subscriber setup
//! ```
//!
//! ## Usage Examples
//!
//! ### STDIO server
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rpcwire_transport::{StdioTransport, Transport};
//!
//! let transport = StdioTransport::stdio();
//! transport.set_message_handler(Arc::new(MyHandler));
//! std::process::exit(transport.run_as_command().await);
//! ```
//!
//! ### HTTP server
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rpcwire_transport::{HttpTransport, Transport};
//!
//! let transport = Arc::new(HttpTransport::http());
//! transport.set_message_handler(Arc::new(MyHandler));
//! transport.start().await?;
//! let app = transport.clone().router("/rpc");
//! axum::serve(tokio::net::TcpListener::bind("127.0.0.1:8080").await?, app).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `stdio` (default): [`StdioTransport`]
//! - `http` (default): [`HttpTransport`], pulls in axum
//! - `metrics`: forwards transport counters to the `metrics` facade

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_panics_doc
)]

pub mod base;
pub mod batching;
pub mod framing;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod resilience;
pub mod stream;

#[cfg(feature = "stdio")]
pub mod stdio;

#[cfg(feature = "http")]
pub mod http;

pub use base::{BaseTransport, REDACTED, TransportBackend};
pub use batching::{BatchConfig, BatchStats, MessageBatcher};
pub use framing::{FramerStats, FramingMode, MessageFramer};
pub use logging::{LogOutput, LoggingConfig, LoggingError, LoggingGuard};
pub use manager::{PooledTransportManager, pool_key};
pub use pool::{
    ConnectionPool, EvictionPolicy, PoolConfig, PoolHealth, PoolInfo, PoolStats,
    PooledConnectionInfo,
};
pub use resilience::{ResilienceConfig, ResilienceStats, ResilientTransport};
pub use stream::{OpenMode, StreamHandler, StreamHealth, StreamStats};

#[cfg(feature = "stdio")]
pub use stdio::{StdioBackend, StdioSignal, StdioTransport, StdioTransportFactory};

#[cfg(feature = "http")]
pub use http::{CorsConfig, HttpBackend, HttpTransport, HttpTransportFactory};

// Re-export the contracts so applications need only this crate
pub use rpcwire_traits::{
    AtomicMetrics, Clock, ConfigProvider, EnvConfigProvider, ErrorObject, HealthReport,
    JSONRPC_VERSION, ManualClock, Message, MessageHandler, MetricsSink, NoopMetricsSink,
    RequestId, StaticConfigProvider, SystemClock, Transport, TransportConfig,
    TransportConfigBuilder, TransportError, TransportFactory, TransportResult, TransportState,
    TransportStats, TransportType, error_codes, keys, standard_error_codes, validate_envelope,
};

#[cfg(feature = "metrics")]
pub use rpcwire_traits::MetricsCrateSink;
