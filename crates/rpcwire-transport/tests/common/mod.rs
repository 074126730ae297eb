//! Shared test doubles.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rpcwire_transport::{
    Message, MessageHandler, Transport, TransportConfig, TransportError, TransportResult,
    TransportType,
};

/// In-memory transport that fails a scripted number of sends and records
/// every delivery.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    failures_left: AtomicU32,
    fail_batches: AtomicBool,
    stalled: AtomicBool,
    disconnected: AtomicBool,
    send_calls: AtomicU32,
    delivered: Mutex<Vec<Message>>,
    batches: Mutex<Vec<usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `n` calls to `send`.
    pub fn failing(n: u32) -> Arc<Self> {
        let transport = Self::default();
        transport.failures_left.store(n, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn set_failures(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    /// While set, `send` never completes.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Flips what `is_connected`, and so `health_check`, reports.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Calls to `send`, successful or not.
    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().clone()
    }

    /// Sizes of successful `send_batch` calls.
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    fn initialize(&self, _config: TransportConfig) -> TransportResult<()> {
        Ok(())
    }

    async fn start(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::SendFailed("scripted failure".to_string()));
        }
        self.delivered.lock().push(message);
        Ok(())
    }

    async fn send_batch(&self, messages: Vec<Message>) -> TransportResult<()> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted batch failure".to_string()));
        }
        self.batches.lock().push(messages.len());
        self.delivered.lock().extend(messages);
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        Ok(None)
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn config(&self) -> TransportConfig {
        TransportConfig::new()
    }

    fn set_message_handler(&self, _handler: Arc<dyn MessageHandler>) {}
}

pub fn notification(n: usize) -> Message {
    Message::notification("tick", Some(serde_json::json!({ "n": n })))
}
