//! Standard I/O transport implementation.
//!
//! [`StdioTransport`] exchanges framed JSON-RPC messages over two
//! [`StreamHandler`]s: process stdin/stdout by default, or any pair of async
//! streams via [`StdioTransport::from_raw`]. The framing mode (line-delimited
//! or Content-Length) is fixed by the `framing` config key when the transport
//! starts.
//!
//! The listen loop is cooperative: each iteration waits up to
//! `poll_interval_ms` for input or a signal, then parses, dispatches and
//! answers every complete message in arrival order before polling again.
//!
//! | Signal | Reaction |
//! |--------|----------|
//! | `SIGTERM`, `SIGINT` | graceful `stop()`, listen loop returns |
//! | `SIGHUP` | re-read the config provider in place |

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use rpcwire_traits::{
    Message, Transport, TransportConfig, TransportError, TransportFactory, TransportResult,
    TransportType, error_codes, keys,
};

use crate::base::{BaseTransport, TransportBackend};
use crate::framing::{FramerStats, FramingMode, MessageFramer};
use crate::stream::{StreamHandler, StreamStats};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process signals the stdio transport reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioSignal {
    /// `SIGTERM`
    Terminate,
    /// `SIGINT`
    Interrupt,
    /// `SIGHUP`
    Hangup,
}

#[cfg(unix)]
struct SignalSet {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalSet {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Option<StdioSignal> {
        tokio::select! {
            s = self.terminate.recv() => s.map(|()| StdioSignal::Terminate),
            s = self.interrupt.recv() => s.map(|()| StdioSignal::Interrupt),
            s = self.hangup.recv() => s.map(|()| StdioSignal::Hangup),
        }
    }
}

#[cfg(not(unix))]
struct SignalSet;

#[cfg(not(unix))]
impl SignalSet {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<StdioSignal> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|()| StdioSignal::Interrupt)
    }
}

async fn next_signal(signals: Option<&mut SignalSet>) -> Option<StdioSignal> {
    match signals {
        Some(set) => set.recv().await,
        None => std::future::pending().await,
    }
}

/// Outcome of one listen-loop poll.
enum LoopEvent {
    Signal(StdioSignal),
    Readable,
    Idle,
}

/// Stdio half of [`StdioTransport`].
pub struct StdioBackend {
    input: TokioMutex<StreamHandler>,
    output: TokioMutex<StreamHandler>,
    framer: Mutex<MessageFramer>,
    pending: Mutex<VecDeque<Message>>,
    signals: TokioMutex<Option<SignalSet>>,
}

impl std::fmt::Debug for StdioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioBackend")
            .field("input", &"<StreamHandler>")
            .field("output", &"<StreamHandler>")
            .field("framer", &self.framer.lock().mode())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl StdioBackend {
    fn with_streams(input: StreamHandler, output: StreamHandler) -> Self {
        Self {
            input: TokioMutex::new(input),
            output: TokioMutex::new(output),
            framer: Mutex::new(MessageFramer::line_delimited()),
            pending: Mutex::new(VecDeque::new()),
            signals: TokioMutex::new(None),
        }
    }

    /// Backend over the current process's stdin/stdout.
    pub fn process() -> Self {
        Self::with_streams(StreamHandler::stdin(), StreamHandler::stdout())
    }

    /// Backend over caller-supplied streams.
    pub fn from_raw<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
        W: AsyncWrite + Send + Sync + 'static,
    {
        Self::with_streams(
            StreamHandler::from_reader(reader),
            StreamHandler::from_writer(writer),
        )
    }

    async fn next_event(&self, poll_interval: Duration) -> LoopEvent {
        let mut signals = self.signals.lock().await;
        let mut input = self.input.lock().await;
        tokio::select! {
            Some(signal) = next_signal(signals.as_mut()) => LoopEvent::Signal(signal),
            readable = input.wait_for_readable(poll_interval) => {
                if readable { LoopEvent::Readable } else { LoopEvent::Idle }
            }
        }
    }

    /// Reads one chunk and parses it.
    ///
    /// `None` means the input reached EOF.
    async fn read_messages(&self) -> TransportResult<Option<Vec<Message>>> {
        let chunk = self.input.lock().await.read().await?;
        match chunk {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => Ok(Some(Vec::new())),
            Some(bytes) => self.framer.lock().parse(&bytes).map(Some),
        }
    }
}

impl Default for StdioBackend {
    fn default() -> Self {
        Self::process()
    }
}

#[async_trait]
impl TransportBackend for StdioBackend {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    fn validate_config(&self, config: &TransportConfig) -> TransportResult<()> {
        FramingMode::from_config(config).map(|_| ())
    }

    async fn do_start(&self, config: &TransportConfig) -> TransportResult<()> {
        *self.framer.lock() = MessageFramer::from_config(config)?;
        self.pending.lock().clear();

        {
            let mut input = self.input.lock().await;
            input.configure(config);
            input.open().await?;
        }
        {
            let mut output = self.output.lock().await;
            output.configure(config);
            output.open().await?;
        }

        if config.get_bool(keys::HANDLE_SIGNALS).unwrap_or(true) {
            match SignalSet::register() {
                Ok(set) => *self.signals.lock().await = Some(set),
                Err(e) => warn!(error = %e, "failed to install signal handlers"),
            }
        }
        Ok(())
    }

    async fn do_stop(&self) -> TransportResult<()> {
        // stop listening for signals
        self.signals.lock().await.take();
        let input = self.input.lock().await.close().await;
        let output = self.output.lock().await.close().await;
        self.framer.lock().clear_buffer();
        input.and(output)
    }

    async fn do_send(&self, message: &Message) -> TransportResult<()> {
        let bytes = self.framer.lock().frame(message)?;
        self.output.lock().await.write(&bytes).await?;
        Ok(())
    }

    async fn do_send_batch(&self, messages: &[Message]) -> TransportResult<()> {
        let bytes = self.framer.lock().frame_all(messages)?;
        self.output.lock().await.write(&bytes).await?;
        Ok(())
    }

    async fn do_receive(&self) -> TransportResult<Option<Message>> {
        if let Some(message) = self.pending.lock().pop_front() {
            return Ok(Some(message));
        }
        let readable = self
            .input
            .lock()
            .await
            .wait_for_readable(DEFAULT_POLL_INTERVAL)
            .await;
        if !readable {
            return Ok(None);
        }
        match self.read_messages().await? {
            Some(messages) => {
                let mut pending = self.pending.lock();
                pending.extend(messages);
                Ok(pending.pop_front())
            }
            None => Err(TransportError::ConnectionLost(
                "input stream closed".to_string(),
            )),
        }
    }

    fn endpoint(&self, _config: &TransportConfig) -> Option<String> {
        Some("stdio://".to_string())
    }
}

/// JSON-RPC over stdin/stdout (or any pair of async streams).
///
/// # Examples
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use rpcwire_transport::{StdioTransport, Transport};
///
/// let transport = StdioTransport::stdio();
/// transport.set_message_handler(Arc::new(MyHandler));
/// let code = transport.run_as_command().await;
/// std::process::exit(code);
/// ```
pub type StdioTransport = BaseTransport<StdioBackend>;

impl BaseTransport<StdioBackend> {
    /// A transport over the current process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(StdioBackend::process())
    }

    /// A transport reading from `reader` and writing to `writer`.
    pub fn from_raw<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
        W: AsyncWrite + Send + Sync + 'static,
    {
        Self::new(StdioBackend::from_raw(reader, writer))
    }

    /// Starts if needed and processes input until the transport stops.
    ///
    /// Returns when input reaches EOF, a terminate/interrupt signal arrives,
    /// or something else calls `stop()`.
    ///
    /// # Errors
    ///
    /// Fatal framing errors (buffer overflow) and stream failures stop the
    /// transport and are returned.
    pub async fn listen(&self) -> TransportResult<()> {
        if !self.is_connected() {
            self.start().await?;
        }
        let poll_interval = self
            .config()
            .get_u64(keys::POLL_INTERVAL_MS)
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis);

        info!("stdio transport listening");
        while self.is_connected() {
            match self.backend().next_event(poll_interval).await {
                LoopEvent::Signal(signal) => self.handle_signal(signal).await?,
                LoopEvent::Readable => self.pump_input().await?,
                LoopEvent::Idle => {}
            }
        }
        info!("stdio transport stopped listening");
        Ok(())
    }

    /// Applies the reaction to `signal`.
    pub async fn handle_signal(&self, signal: StdioSignal) -> TransportResult<()> {
        match signal {
            StdioSignal::Terminate | StdioSignal::Interrupt => {
                info!(?signal, "shutdown signal received");
                self.stop().await
            }
            StdioSignal::Hangup => {
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = self.reload_config() {
                    warn!(error = %e, "configuration reload rejected");
                }
                Ok(())
            }
        }
    }

    /// Runs the transport as a process entry point and returns the exit code.
    ///
    /// `1` if no message handler is installed or the session fails, `0`
    /// after a clean shutdown. The caller is responsible for exiting.
    pub async fn run_as_command(&self) -> i32 {
        if self.message_handler().is_none() {
            error!("no message handler configured");
            return 1;
        }
        if let Err(e) = self.start().await {
            error!(error = %e, "failed to start stdio transport");
            return 1;
        }
        match self.listen().await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "stdio session failed");
                1
            }
        }
    }

    /// Framer counters.
    pub fn framer_stats(&self) -> FramerStats {
        self.backend().framer.lock().stats()
    }

    /// Input and output stream counters.
    pub async fn stream_stats(&self) -> (StreamStats, StreamStats) {
        let input = self.backend().input.lock().await.stats();
        let output = self.backend().output.lock().await.stats();
        (input, output)
    }

    async fn pump_input(&self) -> TransportResult<()> {
        let messages = match self.backend().read_messages().await {
            Ok(Some(messages)) => messages,
            Ok(None) => {
                info!("input closed");
                return self.stop().await;
            }
            Err(e) => {
                error!(error = %e, "input failed, stopping");
                self.record_error();
                // the read error is the one worth reporting
                let _ = self.stop().await;
                return Err(e);
            }
        };

        for message in messages {
            self.process_incoming(message).await;
        }
        Ok(())
    }

    async fn process_incoming(&self, message: Message) {
        let reply_id = message.is_request().then(|| message.id.clone()).flatten();

        let reply = match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => reply_id.map(|id| {
                Message::error_response(error_codes::INTERNAL_ERROR, e.to_string(), None, id)
            }),
        };

        if let Some(reply) = reply
            && let Err(e) = self.send(reply).await
        {
            warn!(error = %e, "failed to write response");
        }
    }
}

/// Creates stdio transports over the process's stdin/stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioTransportFactory;

impl TransportFactory for StdioTransportFactory {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    fn create(&self, config: TransportConfig) -> TransportResult<Box<dyn Transport>> {
        let transport = StdioTransport::stdio();
        transport.initialize(config)?;
        debug!("created stdio transport");
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rpcwire_traits::MessageHandler;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(
            &self,
            message: Message,
            _transport: &dyn Transport,
        ) -> TransportResult<Option<Message>> {
            match message.method.as_deref() {
                Some("fail") => Err(TransportError::Handler("boom".to_string())),
                _ => Ok(message
                    .id
                    .map(|id| Message::response(message.params.unwrap_or(json!(null)), id))),
            }
        }
    }

    /// Declines everything but `echo`.
    struct EchoOnly;

    #[async_trait]
    impl MessageHandler for EchoOnly {
        async fn handle(
            &self,
            message: Message,
            transport: &dyn Transport,
        ) -> TransportResult<Option<Message>> {
            Echo.handle(message, transport).await
        }

        fn can_handle(&self, message: &Message) -> bool {
            message.method.as_deref() == Some("echo")
        }
    }

    fn quiet_config() -> TransportConfig {
        TransportConfig::new().with(keys::HANDLE_SIGNALS, false)
    }

    fn pipe() -> (StdioTransport, DuplexStream, DuplexStream) {
        let (client_in, server_in) = tokio::io::duplex(4096);
        let (server_out, client_out) = tokio::io::duplex(4096);
        let transport = StdioTransport::from_raw(server_in, server_out);
        transport.initialize(quiet_config()).unwrap();
        (transport, client_in, client_out)
    }

    async fn read_all(mut stream: DuplexStream) -> String {
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_run_without_handler_returns_1() {
        let (transport, _client_in, _client_out) = pipe();
        assert_eq!(transport.run_as_command().await, 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_echo_session_until_eof() {
        let (transport, mut client_in, client_out) = pipe();
        transport.set_message_handler(Arc::new(Echo));

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":[1],\"id\":1}\n")
            .await
            .unwrap();
        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"note\"}\nnot json\n")
            .await
            .unwrap();
        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"fail\",\"id\":\"x\"}\n")
            .await
            .unwrap();
        drop(client_in);

        assert_eq!(transport.run_as_command().await, 0);
        assert!(!transport.is_connected());
        drop(transport);

        let output = read_all(client_out).await;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"jsonrpc":"2.0","id":1,"result":[1]}"#);
        let error: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(error["id"], "x");
        assert_eq!(error["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_declined_request_is_answered() {
        let (transport, mut client_in, client_out) = pipe();
        transport.set_message_handler(Arc::new(EchoOnly));

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"secret\",\"id\":4}\n")
            .await
            .unwrap();
        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"secret\"}\n")
            .await
            .unwrap();
        drop(client_in);

        assert_eq!(transport.run_as_command().await, 0);
        drop(transport);

        let output = read_all(client_out).await;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        let reply: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            reply,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "error": {
                    "code": -32601,
                    "message": "Method not found",
                    "data": { "method": "secret" }
                }
            })
        );
    }

    #[tokio::test]
    async fn test_content_length_session() {
        let (transport, mut client_in, client_out) = pipe();
        transport
            .initialize(quiet_config().with(keys::FRAMING, "content-length"))
            .unwrap();
        transport.set_message_handler(Arc::new(Echo));

        let body = br#"{"jsonrpc":"2.0","method":"ping","id":7}"#;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(body);
        client_in.write_all(&frame).await.unwrap();
        drop(client_in);

        assert_eq!(transport.run_as_command().await, 0);
        assert_eq!(transport.framer_stats().messages_parsed, 1);
        drop(transport);

        let output = read_all(client_out).await;
        let expected_body = r#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        assert_eq!(
            output,
            format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n{}",
                expected_body.len(),
                expected_body
            )
        );
    }

    #[tokio::test]
    async fn test_terminate_signal_stops_listen() {
        let (transport, _client_in, _client_out) = pipe();
        let transport = Arc::new(transport);
        transport.set_message_handler(Arc::new(Echo));
        transport.start().await.unwrap();

        let listener = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.listen().await })
        };
        transport
            .handle_signal(StdioSignal::Terminate)
            .await
            .unwrap();
        listener.await.unwrap().unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (transport, mut client_in, client_out) = pipe();
        transport.start().await.unwrap();

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n{\"jsonrpc\":\"2.0\",\"method\":\"b\"}\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        while received.len() < 2 {
            if let Some(message) = transport.receive().await.unwrap() {
                received.push(message.method.unwrap_or_default());
            }
        }
        assert_eq!(received, vec!["a", "b"]);

        transport
            .send_batch(vec![
                Message::notification("x", None),
                Message::notification("y", None),
            ])
            .await
            .unwrap();
        transport.stop().await.unwrap();
        assert_eq!(transport.stats().messages_sent, 2);
        assert_eq!(transport.stats().messages_received, 2);
        drop(transport);

        let output = read_all(client_out).await;
        assert_eq!(output.lines().count(), 2);
    }

    #[test]
    fn test_invalid_framing_rejected_at_initialize() {
        let transport = StdioTransport::from_raw(tokio::io::empty(), tokio::io::sink());
        let err = transport
            .initialize(TransportConfig::new().with(keys::FRAMING, "xml"))
            .unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[test]
    fn test_unrepresentable_durations_rejected_at_initialize() {
        let transport = StdioTransport::from_raw(tokio::io::empty(), tokio::io::sink());
        for config in [
            TransportConfig::new().with(keys::TIMEOUT, 1e300),
            TransportConfig::new().with(keys::RETRY_DELAY, 1e300),
        ] {
            let err = transport.initialize(config).unwrap_err();
            assert!(matches!(err, TransportError::ConfigurationError(_)));
        }
        assert_eq!(transport.config().timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_endpoint() {
        let transport = StdioTransport::from_raw(tokio::io::empty(), tokio::io::sink());
        assert_eq!(transport.endpoint().as_deref(), Some("stdio://"));
    }
}
