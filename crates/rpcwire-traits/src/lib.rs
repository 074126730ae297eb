//! # rpcwire traits
//!
//! Core message model and contracts for the rpcwire JSON-RPC transport layer.
//! Transport implementations and applications both depend on this crate; it has
//! no I/O of its own.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Messages**: [`Message`], [`RequestId`], [`ErrorObject`], [`error_codes`]
//! - **Traits**: [`Transport`], [`MessageHandler`], [`TransportFactory`]
//! - **Types**: [`TransportType`], [`TransportState`], [`HealthReport`]
//! - **Errors**: [`TransportError`], [`TransportResult`]
//! - **Config**: [`TransportConfig`], [`TransportConfigBuilder`], [`ConfigProvider`]
//! - **Metrics**: [`AtomicMetrics`], [`TransportStats`], [`MetricsSink`]
//! - **Time**: [`Clock`], [`SystemClock`], [`ManualClock`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rpcwire_traits::{Message, MessageHandler, Transport, TransportResult};
//! use async_trait::async_trait;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn handle(
//!         &self,
//!         message: Message,
//!         _transport: &dyn Transport,
//!     ) -> TransportResult<Option<Message>> {
//!         Ok(message.id.clone().map(|id| Message::response(message.params.unwrap_or_default(), id)))
//!     }
//! }
//! ```

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
    clippy::must_use_candidate
)]

mod clock;
mod config;
mod error;
mod message;
mod metrics;
mod provider;
mod traits;
mod types;

// Re-export all public items
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{TransportConfig, TransportConfigBuilder, keys};
pub use error::{TransportError, TransportResult};
pub use message::{
    ErrorObject, JSONRPC_VERSION, Message, RequestId, error_codes, standard_error_codes,
    validate_envelope,
};
#[cfg(feature = "metrics")]
pub use metrics::MetricsCrateSink;
pub use metrics::{AtomicMetrics, MetricsSink, NoopMetricsSink, TransportStats};
pub use provider::{ConfigProvider, EnvConfigProvider, StaticConfigProvider};
pub use traits::{MessageHandler, Transport, TransportFactory};
pub use types::{HealthReport, TransportState, TransportType};
