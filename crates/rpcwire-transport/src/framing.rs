//! JSON-RPC message framing.
//!
//! [`MessageFramer`] converts between [`Message`] values and wire bytes in one
//! of two modes, fixed at construction:
//!
//! - **Line-delimited**: compact JSON followed by a delimiter (default `\n`).
//! - **Content-Length**: an RFC 2822 style header block, a blank line, then
//!   exactly `Content-Length` bytes of JSON.
//!
//! Malformed segments are counted and skipped. Buffering more than
//! `max_buffer_size` bytes without finding a message boundary is fatal.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use rpcwire_traits::{
    Message, RequestId, TransportConfig, TransportError, TransportResult, keys,
    standard_error_codes,
};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Wire format used by a framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingMode {
    /// One JSON document per delimiter-terminated segment.
    LineDelimited {
        /// Segment terminator
        delimiter: Bytes,
    },
    /// `Content-Length` header block followed by the body.
    ContentLength,
}

impl FramingMode {
    /// Line-delimited framing with `\n`.
    pub fn line() -> Self {
        Self::LineDelimited {
            delimiter: Bytes::from_static(b"\n"),
        }
    }

    /// Reads `framing` and `line_delimiter` from a transport config.
    pub fn from_config(config: &TransportConfig) -> TransportResult<Self> {
        match config.get_str(keys::FRAMING).unwrap_or("line") {
            "line" => {
                let delimiter = config.get_str(keys::LINE_DELIMITER).unwrap_or("\n");
                if delimiter.is_empty() {
                    return Err(TransportError::ConfigurationError(
                        "line_delimiter must not be empty".to_string(),
                    ));
                }
                Ok(Self::LineDelimited {
                    delimiter: Bytes::copy_from_slice(delimiter.as_bytes()),
                })
            }
            "content-length" => Ok(Self::ContentLength),
            other => Err(TransportError::ConfigurationError(format!(
                "unknown framing mode {other:?}, expected \"line\" or \"content-length\""
            ))),
        }
    }
}

impl Default for FramingMode {
    fn default() -> Self {
        Self::line()
    }
}

/// Framer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramerStats {
    /// Messages encoded by `frame`
    pub messages_framed: u64,
    /// Messages successfully decoded
    pub messages_parsed: u64,
    /// Segments skipped because they failed to decode or validate
    pub parse_errors: u64,
}

/// Encodes and decodes JSON-RPC messages, owning a parse buffer.
#[derive(Debug)]
pub struct MessageFramer {
    mode: FramingMode,
    buffer: BytesMut,
    max_buffer_size: usize,
    stats: FramerStats,
}

impl MessageFramer {
    /// Creates a framer.
    pub fn new(mode: FramingMode, max_buffer_size: usize) -> Self {
        Self {
            mode,
            buffer: BytesMut::new(),
            max_buffer_size,
            stats: FramerStats::default(),
        }
    }

    /// Newline-delimited framer with the default buffer limit.
    pub fn line_delimited() -> Self {
        Self::new(FramingMode::line(), DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Content-Length framer with the default buffer limit.
    pub fn content_length() -> Self {
        Self::new(FramingMode::ContentLength, DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Builds a framer from `framing`, `line_delimiter` and `max_buffer_size`.
    pub fn from_config(config: &TransportConfig) -> TransportResult<Self> {
        let mode = FramingMode::from_config(config)?;
        let max = config
            .get_u64(keys::MAX_BUFFER_SIZE)
            .map_or(DEFAULT_MAX_BUFFER_SIZE, |n| n as usize);
        Ok(Self::new(mode, max))
    }

    /// The framing mode.
    pub const fn mode(&self) -> &FramingMode {
        &self.mode
    }

    /// The buffer limit in bytes.
    pub const fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Bytes held that do not yet form a complete message.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Validates and encodes one message.
    pub fn frame(&mut self, message: &Message) -> TransportResult<Bytes> {
        message.validate()?;
        let body = message.to_vec()?;

        let mut out = match &self.mode {
            FramingMode::LineDelimited { delimiter } => {
                let mut out = BytesMut::with_capacity(body.len() + delimiter.len());
                out.extend_from_slice(&body);
                out.extend_from_slice(delimiter);
                out
            }
            FramingMode::ContentLength => {
                let header = format!(
                    "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                    body.len()
                );
                let mut out = BytesMut::with_capacity(header.len() + body.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(&body);
                out
            }
        };

        self.stats.messages_framed += 1;
        Ok(out.split().freeze())
    }

    /// Encodes several messages into one contiguous buffer.
    pub fn frame_all(&mut self, messages: &[Message]) -> TransportResult<Bytes> {
        let mut out = BytesMut::new();
        for message in messages {
            out.extend_from_slice(&self.frame(message)?);
        }
        Ok(out.freeze())
    }

    /// Appends `bytes` to the buffer and returns every complete message.
    ///
    /// Incomplete trailing data stays buffered for the next call.
    ///
    /// # Errors
    ///
    /// [`TransportError::BufferOverflow`] if the incomplete remainder exceeds
    /// the buffer limit. The buffer is discarded in that case.
    pub fn parse(&mut self, bytes: &[u8]) -> TransportResult<Vec<Message>> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let result = loop {
            match self.decode_from(&mut buffer) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = result {
            // boundary unknown: nothing buffered can be trusted
            self.buffer = BytesMut::new();
            return Err(e);
        }

        self.buffer = buffer;
        Ok(messages)
    }

    /// Drops any buffered bytes.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Current counters.
    pub const fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Zeroes the counters.
    pub fn reset_stats(&mut self) {
        self.stats = FramerStats::default();
    }

    /// Decodes the next valid message in `buf`, skipping malformed segments.
    fn decode_from(&mut self, buf: &mut BytesMut) -> TransportResult<Option<Message>> {
        loop {
            let segment = match &self.mode {
                FramingMode::LineDelimited { delimiter } => {
                    let Some(pos) = find(buf, delimiter) else {
                        break;
                    };
                    let line = buf.split_to(pos);
                    buf.advance(delimiter.len());
                    line.freeze()
                }
                FramingMode::ContentLength => {
                    let Some(header_end) = find(buf, HEADER_TERMINATOR) else {
                        break;
                    };
                    let Some(length) = content_length(&buf[..header_end]) else {
                        warn!("dropping header block without a valid Content-Length");
                        self.stats.parse_errors += 1;
                        buf.advance(header_end + HEADER_TERMINATOR.len());
                        continue;
                    };
                    if length > self.max_buffer_size {
                        return Err(TransportError::BufferOverflow {
                            size: length,
                            max: self.max_buffer_size,
                        });
                    }
                    let body_start = header_end + HEADER_TERMINATOR.len();
                    if buf.len() < body_start + length {
                        break;
                    }
                    buf.advance(body_start);
                    buf.split_to(length).freeze()
                }
            };

            let trimmed = segment.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            match Message::from_slice(trimmed) {
                Ok(message) => {
                    self.stats.messages_parsed += 1;
                    trace!(kind = message.kind(), "parsed message");
                    return Ok(Some(message));
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed message");
                    self.stats.parse_errors += 1;
                }
            }
        }

        if buf.len() > self.max_buffer_size {
            return Err(TransportError::BufferOverflow {
                size: buf.len(),
                max: self.max_buffer_size,
            });
        }
        Ok(None)
    }

    /// Builds a request, or a notification when `id` is `None`.
    pub fn create_request(
        method: impl Into<String>,
        params: Option<Value>,
        id: Option<RequestId>,
    ) -> Message {
        match id {
            Some(id) => Message::request(method, params, id),
            None => Message::notification(method, params),
        }
    }

    /// Builds a success response.
    pub fn create_response(result: Value, id: impl Into<RequestId>) -> Message {
        Message::response(result, id)
    }

    /// Builds an error response.
    pub fn create_error_response(
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
        id: impl Into<RequestId>,
    ) -> Message {
        Message::error_response(code, message, data, id)
    }

    /// See [`Message::is_request`].
    pub fn is_request(message: &Message) -> bool {
        message.is_request()
    }

    /// See [`Message::is_response`].
    pub fn is_response(message: &Message) -> bool {
        message.is_response()
    }

    /// See [`Message::is_notification`].
    pub fn is_notification(message: &Message) -> bool {
        message.is_notification()
    }

    /// The standard JSON-RPC error codes by name.
    pub const fn error_codes() -> &'static [(&'static str, i64)] {
        standard_error_codes()
    }
}

impl Decoder for MessageFramer {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_from(src)
    }
}

impl Encoder<Message> for MessageFramer {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let framed = self.frame(&item)?;
        dst.extend_from_slice(&framed);
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extracts `Content-Length` from a header block, case-insensitively.
fn content_length(headers: &[u8]) -> Option<usize> {
    let headers = std::str::from_utf8(headers).ok()?;
    headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
