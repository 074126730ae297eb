//! Buffered byte-stream I/O.
//!
//! [`StreamHandler`] wraps one readable and/or writable resource (process
//! stdin/stdout, a file, or any boxed `AsyncRead`/`AsyncWrite`) behind a small
//! open/read/write/close API with per-operation timeouts, bounded line
//! reading and readiness polling.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace, warn};

use rpcwire_traits::{TransportConfig, TransportError, TransportResult, keys};

type BoxedAsyncRead = Pin<Box<dyn AsyncRead + Send + Sync + 'static>>;
type BoxedAsyncBufRead = BufReader<BoxedAsyncRead>;
type BoxedAsyncWrite = Pin<Box<dyn AsyncWrite + Send + Sync + 'static>>;

const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_READ_CHUNK_SIZE: usize = 8192;

/// How a file-backed stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read from an existing file
    Read,
    /// Create or truncate, then write
    Write,
    /// Create if missing, then append
    Append,
}

/// Source of the underlying resource
enum StreamSource {
    /// The current process's stdin
    Stdin,
    /// The current process's stdout
    Stdout,
    /// A file on disk
    File { path: PathBuf, mode: OpenMode },
    /// Caller-supplied streams (already boxed)
    Raw {
        reader: Option<BoxedAsyncRead>,
        writer: Option<BoxedAsyncWrite>,
    },
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "Stdin"),
            Self::Stdout => write!(f, "Stdout"),
            Self::File { path, mode } => f
                .debug_struct("File")
                .field("path", path)
                .field("mode", mode)
                .finish(),
            Self::Raw { reader, writer } => f
                .debug_struct("Raw")
                .field("reader", &reader.as_ref().map(|_| "<async reader>"))
                .field("writer", &writer.as_ref().map(|_| "<async writer>"))
                .finish(),
        }
    }
}

/// Read/write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Bytes returned by reads
    pub bytes_read: u64,
    /// Bytes accepted by writes
    pub bytes_written: u64,
    /// Completed read operations
    pub read_operations: u64,
    /// Completed write operations
    pub write_operations: u64,
}

/// Result of [`StreamHandler::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHealth {
    /// Open, not at EOF, and usable in at least one direction
    pub healthy: bool,
    /// The stream is open
    pub open: bool,
    /// Reads are possible
    pub readable: bool,
    /// Writes are possible
    pub writable: bool,
}

enum ReadOutcome {
    Data(Bytes),
    Pending,
    Eof,
}

/// A buffered, timeout-aware byte stream.
pub struct StreamHandler {
    source: StreamSource,
    reader: Option<BoxedAsyncBufRead>,
    writer: Option<BoxedAsyncWrite>,
    open: bool,
    eof: bool,
    line_buffer: BytesMut,
    blocking: bool,
    timeout: Option<Duration>,
    max_buffer_size: usize,
    read_chunk_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    stats: StreamStats,
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("source", &self.source)
            .field("open", &self.open)
            .field("eof", &self.eof)
            .field("buffered", &self.line_buffer.len())
            .field("blocking", &self.blocking)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl StreamHandler {
    fn with_source(source: StreamSource) -> Self {
        Self {
            source,
            reader: None,
            writer: None,
            open: false,
            eof: false,
            line_buffer: BytesMut::new(),
            blocking: true,
            timeout: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(10),
            stats: StreamStats::default(),
        }
    }

    /// The current process's stdin.
    pub fn stdin() -> Self {
        Self::with_source(StreamSource::Stdin)
    }

    /// The current process's stdout.
    pub fn stdout() -> Self {
        Self::with_source(StreamSource::Stdout)
    }

    /// A file opened in `mode` on [`open`](Self::open).
    pub fn file(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        Self::with_source(StreamSource::File {
            path: path.into(),
            mode,
        })
    }

    /// A read-only stream over any async reader.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        Self::with_source(StreamSource::Raw {
            reader: Some(Box::pin(reader)),
            writer: None,
        })
    }

    /// A write-only stream over any async writer.
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Sync + 'static,
    {
        Self::with_source(StreamSource::Raw {
            reader: None,
            writer: Some(Box::pin(writer)),
        })
    }

    /// Applies `max_buffer_size`, `read_chunk_size`, `retry_attempts`,
    /// `retry_delay` and `timeout` from a transport config.
    pub fn configure(&mut self, config: &TransportConfig) {
        if let Some(max) = config.get_u64(keys::MAX_BUFFER_SIZE) {
            self.max_buffer_size = max as usize;
        }
        if let Some(chunk) = config.get_u64(keys::READ_CHUNK_SIZE).filter(|n| *n > 0) {
            self.read_chunk_size = chunk as usize;
        }
        self.retry_attempts = config.retry_attempts();
        self.retry_delay = config.retry_delay();
        if config.get(keys::TIMEOUT).is_some() {
            self.timeout = Some(config.timeout());
        }
    }

    /// Opens the underlying resource. A no-op if already open.
    pub async fn open(&mut self) -> TransportResult<()> {
        if self.open {
            return Ok(());
        }

        match &mut self.source {
            StreamSource::Stdin => {
                let stdin: BoxedAsyncRead = Box::pin(tokio::io::stdin());
                self.reader = Some(BufReader::new(stdin));
            }
            StreamSource::Stdout => {
                self.writer = Some(Box::pin(tokio::io::stdout()));
            }
            StreamSource::File { path, mode } => {
                let mut options = tokio::fs::OpenOptions::new();
                match mode {
                    OpenMode::Read => options.read(true),
                    OpenMode::Write => options.write(true).create(true).truncate(true),
                    OpenMode::Append => options.append(true).create(true),
                };
                let file = options.open(&*path).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!(
                        "failed to open {}: {e}",
                        path.display()
                    ))
                })?;
                if *mode == OpenMode::Read {
                    let boxed: BoxedAsyncRead = Box::pin(file);
                    self.reader = Some(BufReader::new(boxed));
                } else {
                    self.writer = Some(Box::pin(file));
                }
            }
            StreamSource::Raw { reader, writer } => {
                if reader.is_none() && writer.is_none() {
                    return Err(TransportError::ConfigurationError(
                        "Raw stream already consumed".to_string(),
                    ));
                }
                self.reader = reader.take().map(BufReader::new);
                self.writer = writer.take();
            }
        }

        self.open = true;
        self.eof = false;
        debug!(source = ?self.source, "stream opened");
        Ok(())
    }

    /// Flushes pending output and releases the resource.
    pub async fn close(&mut self) -> TransportResult<()> {
        if !self.open {
            return Ok(());
        }
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.flush().await
        {
            warn!(error = %e, "flush on close failed");
        }
        self.reader = None;
        self.writer = None;
        self.line_buffer.clear();
        self.open = false;
        debug!(source = ?self.source, "stream closed");
        Ok(())
    }

    /// `true` between `open` and `close`.
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Reads whatever is available.
    ///
    /// Returns `None` at EOF. In non-blocking mode an empty `Bytes` means no
    /// data is ready yet.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if a blocking read exceeds the configured
    /// timeout, [`TransportError::ConnectionFailed`] if not open for reading.
    pub async fn read(&mut self) -> TransportResult<Option<Bytes>> {
        if !self.line_buffer.is_empty() {
            let data = self.line_buffer.split().freeze();
            self.record_read(data.len());
            return Ok(Some(data));
        }
        match self.read_chunk().await? {
            ReadOutcome::Data(data) => {
                self.record_read(data.len());
                Ok(Some(data))
            }
            ReadOutcome::Pending => Ok(Some(Bytes::new())),
            ReadOutcome::Eof => Ok(None),
        }
    }

    /// Reads up to and excluding `delimiter`.
    ///
    /// At EOF a trailing partial line is returned as-is, then `None`. In
    /// non-blocking mode `None` with [`is_eof`](Self::is_eof) `false` means no
    /// complete line is ready yet; the partial line stays buffered.
    ///
    /// # Errors
    ///
    /// [`TransportError::BufferOverflow`] if the line grows past
    /// `max_buffer_size` without a delimiter. The partial line is discarded.
    pub async fn read_line(&mut self, delimiter: &[u8]) -> TransportResult<Option<String>> {
        loop {
            if let Some(pos) = find(&self.line_buffer, delimiter) {
                let line = self.line_buffer.split_to(pos);
                let _ = self.line_buffer.split_to(delimiter.len());
                self.record_read(line.len() + delimiter.len());
                return decode_line(&line).map(Some);
            }

            if self.line_buffer.len() > self.max_buffer_size {
                let size = self.line_buffer.len();
                self.line_buffer.clear();
                return Err(TransportError::BufferOverflow {
                    size,
                    max: self.max_buffer_size,
                });
            }

            match self.read_chunk().await? {
                ReadOutcome::Data(data) => self.line_buffer.extend_from_slice(&data),
                ReadOutcome::Pending => return Ok(None),
                ReadOutcome::Eof if self.line_buffer.is_empty() => return Ok(None),
                ReadOutcome::Eof => {
                    let line = self.line_buffer.split();
                    self.record_read(line.len());
                    return decode_line(&line).map(Some);
                }
            }
        }
    }

    /// Writes all of `data` and flushes.
    ///
    /// A write that makes no progress or fails is retried up to
    /// `retry_attempts` times, `retry_delay` apart.
    pub async fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        let timeout = self.effective_timeout();
        let retry_attempts = self.retry_attempts;
        let retry_delay = self.retry_delay;
        let writer = self.writable_stream()?;

        let mut written = 0;
        let mut retries = 0;
        while written < data.len() {
            let attempt = with_timeout(timeout, writer.write(&data[written..])).await;
            let failure = match attempt {
                Ok(0) => TransportError::SendFailed(format!(
                    "wrote {written} of {} bytes",
                    data.len()
                )),
                Ok(n) => {
                    written += n;
                    continue;
                }
                Err(e) => e,
            };

            if retries >= retry_attempts {
                return Err(failure);
            }
            retries += 1;
            trace!(retries, error = %failure, "retrying stream write");
            tokio::time::sleep(retry_delay).await;
        }

        with_timeout(timeout, writer.flush()).await?;
        self.stats.bytes_written += written as u64;
        self.stats.write_operations += 1;
        Ok(written)
    }

    /// Writes `line` followed by `delimiter`.
    pub async fn write_line(&mut self, line: &str, delimiter: &[u8]) -> TransportResult<usize> {
        let mut data = Vec::with_capacity(line.len() + delimiter.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(delimiter);
        self.write(&data).await
    }

    /// Open with a reader.
    pub const fn is_readable(&self) -> bool {
        self.open && self.reader.is_some()
    }

    /// Open with a writer.
    pub const fn is_writable(&self) -> bool {
        self.open && self.writer.is_some()
    }

    /// `true` once the reader has reported end of stream.
    pub const fn is_eof(&self) -> bool {
        self.eof
    }

    /// Non-blocking reads return immediately when no data is ready.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Per-operation timeout for blocking reads and all writes.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Waits up to `timeout` for data (or EOF) to be readable.
    pub async fn wait_for_readable(&mut self, timeout: Duration) -> bool {
        if !self.is_readable() {
            return false;
        }
        if !self.line_buffer.is_empty() {
            return true;
        }
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        if !reader.buffer().is_empty() {
            return true;
        }
        tokio::time::timeout(timeout, reader.fill_buf()).await.is_ok()
    }

    /// Waits up to `timeout` for pending output to drain.
    pub async fn wait_for_writable(&mut self, timeout: Duration) -> bool {
        if !self.is_writable() {
            return false;
        }
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, writer.flush()).await,
            Ok(Ok(()))
        )
    }

    /// Open/readable/writable summary.
    pub const fn health_check(&self) -> StreamHealth {
        let readable = self.is_readable();
        let writable = self.is_writable();
        StreamHealth {
            healthy: self.open && !self.eof && (readable || writable),
            open: self.open,
            readable,
            writable,
        }
    }

    /// Current counters.
    pub const fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Zeroes the counters.
    pub fn reset_stats(&mut self) {
        self.stats = StreamStats::default();
    }

    fn record_read(&mut self, n: usize) {
        self.stats.bytes_read += n as u64;
        self.stats.read_operations += 1;
    }

    const fn effective_timeout(&self) -> Option<Duration> {
        if self.blocking { self.timeout } else { None }
    }

    fn writable_stream(&mut self) -> TransportResult<&mut BoxedAsyncWrite> {
        if !self.open {
            return Err(TransportError::ConnectionFailed(
                "stream is not open".to_string(),
            ));
        }
        self.writer.as_mut().ok_or_else(|| {
            TransportError::ConnectionFailed("stream is not open for writing".to_string())
        })
    }

    async fn read_chunk(&mut self) -> TransportResult<ReadOutcome> {
        if !self.open {
            return Err(TransportError::ConnectionFailed(
                "stream is not open".to_string(),
            ));
        }
        let blocking = self.blocking;
        let timeout = self.timeout;
        let chunk_size = self.read_chunk_size;
        let reader = self.reader.as_mut().ok_or_else(|| {
            TransportError::ConnectionFailed("stream is not open for reading".to_string())
        })?;

        let outcome = if blocking {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, fill_chunk(reader, chunk_size))
                    .await
                    .map_err(|_| TransportError::Timeout(limit))??,
                None => fill_chunk(reader, chunk_size).await?,
            }
        } else {
            tokio::time::timeout(Duration::ZERO, fill_chunk(reader, chunk_size))
                .await
                .unwrap_or(Ok(ReadOutcome::Pending))?
        };

        if matches!(outcome, ReadOutcome::Eof) {
            self.eof = true;
        }
        Ok(outcome)
    }
}

async fn fill_chunk(reader: &mut BoxedAsyncBufRead, chunk_size: usize) -> TransportResult<ReadOutcome> {
    let available = reader.fill_buf().await?;
    if available.is_empty() {
        return Ok(ReadOutcome::Eof);
    }
    let n = available.len().min(chunk_size);
    let data = Bytes::copy_from_slice(&available[..n]);
    reader.consume(n);
    Ok(ReadOutcome::Data(data))
}

async fn with_timeout<T, F>(limit: Option<Duration>, op: F) -> TransportResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| TransportError::Timeout(limit))?
            .map_err(TransportError::from),
        None => op.await.map_err(TransportError::from),
    }
}

fn decode_line(line: &[u8]) -> TransportResult<String> {
    String::from_utf8(line.to_vec())
        .map_err(|e| TransportError::ReceiveFailed(format!("line is not valid UTF-8: {e}")))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_returns_none_at_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();

        tx.write_all(b"hello").await.unwrap();
        drop(tx);

        assert_eq!(stream.read().await.unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(stream.read().await.unwrap(), None);
        assert!(stream.is_eof());
        assert_eq!(stream.stats().bytes_read, 5);
    }

    #[tokio::test]
    async fn test_read_line_splits_and_keeps_remainder() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();

        tx.write_all(b"one\ntwo\nthr").await.unwrap();
        drop(tx);

        assert_eq!(stream.read_line(b"\n").await.unwrap().as_deref(), Some("one"));
        assert_eq!(stream.read_line(b"\n").await.unwrap().as_deref(), Some("two"));
        assert_eq!(stream.read_line(b"\n").await.unwrap().as_deref(), Some("thr"));
        assert_eq!(stream.read_line(b"\n").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_overflow() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut stream = StreamHandler::from_reader(rx);
        stream.configure(&TransportConfig::new().with(keys::MAX_BUFFER_SIZE, 8));
        stream.open().await.unwrap();

        tx.write_all(&[b'a'; 32]).await.unwrap();
        drop(tx);

        let err = stream.read_line(b"\n").await.unwrap_err();
        assert!(matches!(err, TransportError::BufferOverflow { max: 8, .. }));
    }

    #[tokio::test]
    async fn test_non_blocking_read_without_data() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();
        stream.set_blocking(false);

        let data = stream.read().await.unwrap().unwrap();
        assert!(data.is_empty());
        assert!(!stream.is_eof());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();
        stream.set_timeout(Some(Duration::from_millis(50)));

        let err = stream.read().await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_read_line_waits_for_delimiter() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();

        tx.write_all(b"partial").await.unwrap();
        {
            let mut line = tokio_test::task::spawn(stream.read_line(b"\n"));
            tokio_test::assert_pending!(line.poll());

            tx.write_all(b" line\n").await.unwrap();
            assert!(line.is_woken());
            let line = tokio_test::assert_ready_ok!(line.poll());
            assert_eq!(line.as_deref(), Some("partial line"));
        }
        assert_eq!(stream.stats().bytes_read, 13);
    }

    #[tokio::test]
    async fn test_write_and_write_line() {
        let (tx, mut rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_writer(tx);
        stream.open().await.unwrap();

        assert_eq!(stream.write(b"ab").await.unwrap(), 2);
        assert_eq!(stream.write_line("cd", b"\n").await.unwrap(), 3);
        stream.close().await.unwrap();
        drop(stream);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut rx, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abcd\n");
    }

    #[tokio::test]
    async fn test_direction_checks() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        assert!(!stream.is_readable());
        stream.open().await.unwrap();
        assert!(stream.is_readable());
        assert!(!stream.is_writable());
        assert!(matches!(
            stream.write(b"x").await,
            Err(TransportError::ConnectionFailed(_))
        ));

        let health = stream.health_check();
        assert!(health.healthy);
        assert!(health.open && health.readable && !health.writable);

        stream.close().await.unwrap();
        assert!(!stream.health_check().healthy);
    }

    #[tokio::test]
    async fn test_raw_stream_cannot_reopen() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();
        stream.close().await.unwrap();
        assert!(matches!(
            stream.open().await,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_readable() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut stream = StreamHandler::from_reader(rx);
        stream.open().await.unwrap();

        assert!(!stream.wait_for_readable(Duration::from_millis(10)).await);
        tx.write_all(b"x").await.unwrap();
        assert!(stream.wait_for_readable(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.log");

        let mut writer = StreamHandler::file(&path, OpenMode::Write);
        writer.open().await.unwrap();
        writer.write_line("first", b"\n").await.unwrap();
        writer.close().await.unwrap();

        let mut appender = StreamHandler::file(&path, OpenMode::Append);
        appender.open().await.unwrap();
        appender.write_line("second", b"\n").await.unwrap();
        appender.close().await.unwrap();

        let mut reader = StreamHandler::file(&path, OpenMode::Read);
        reader.open().await.unwrap();
        assert_eq!(reader.read_line(b"\n").await.unwrap().as_deref(), Some("first"));
        assert_eq!(reader.read_line(b"\n").await.unwrap().as_deref(), Some("second"));
        assert_eq!(reader.read_line(b"\n").await.unwrap(), None);
        assert_eq!(reader.stats().read_operations, 2);
    }

    #[tokio::test]
    async fn test_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = StreamHandler::file(dir.path().join("absent"), OpenMode::Read);
        assert!(matches!(
            stream.open().await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert!(!stream.is_open());
    }
}
