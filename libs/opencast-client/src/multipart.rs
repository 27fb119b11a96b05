//! Streaming `multipart/form-data` encoder.
//!
//! A [`Multipart`] message is an ordered list of [`Part`]s and a boundary token.
//! [`Multipart::reader`] spawns a producer task that frames each part into a
//! bounded channel, so arbitrarily large bodies are never held in memory and a
//! slow consumer throttles the producer. Producer failures are delivered to the
//! consumer as stream errors; a body that stops before its closing boundary is
//! never reported as complete.
//!
//! Wire layout, per part in insertion order:
//!
//! ```text
//! --{boundary}\r\n
//! {Key}: {value}\r\n        (keys sorted, one line per value)
//! \r\n
//! {body}\r\n
//! ```
//!
//! followed by `--{boundary}--\r\n`.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::task::AbortOnDropHandle;

/// Random bytes in a generated boundary (hex-encoded to twice as many chars).
const BOUNDARY_BYTES: usize = 30;

/// Chunks buffered between the producer task and the consumer.
const CHANNEL_CAPACITY: usize = 8;

const CRLF: &[u8] = b"\r\n";

/// Content type of file and stream parts.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Escape `\` and `"` for use inside a quoted header parameter.
#[must_use]
pub fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Generate a boundary of 30 random bytes, hex-encoded.
#[must_use]
pub fn random_boundary() -> String {
    let mut buf = [0u8; BOUNDARY_BYTES];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

type PartReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where a part's body comes from.
pub enum PartSource {
    /// In-memory bytes.
    Bytes(Bytes),
    /// A file opened when the part is encoded.
    File(PathBuf),
    /// A reader that can be consumed once.
    Stream(Mutex<Option<PartReader>>),
}

impl PartSource {
    /// Wrap a single-use reader.
    #[must_use]
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        PartSource::Stream(Mutex::new(Some(Box::new(reader))))
    }

    fn len(&self) -> Option<u64> {
        match self {
            PartSource::Bytes(bytes) => Some(bytes.len() as u64),
            PartSource::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
            PartSource::Stream(_) => None,
        }
    }
}

impl fmt::Debug for PartSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            PartSource::File(path) => f.debug_tuple("File").field(path).finish(),
            PartSource::Stream(slot) => f
                .debug_struct("Stream")
                .field("consumed", &slot.lock().is_none())
                .finish(),
        }
    }
}

/// One part of a multipart message: headers plus a body source.
///
/// Header names are case-sensitive and emitted in sorted order.
#[derive(Debug)]
pub struct Part {
    headers: BTreeMap<String, Vec<String>>,
    source: PartSource,
}

impl Part {
    /// A part with no headers.
    #[must_use]
    pub fn new(source: PartSource) -> Self {
        Self {
            headers: BTreeMap::new(),
            source,
        }
    }

    /// Form field with an in-memory value.
    #[must_use]
    pub fn field(name: &str, value: impl Into<Bytes>) -> Self {
        Self::new(PartSource::Bytes(value.into())).with_header(
            "Content-Disposition",
            format!(r#"form-data; name="{}""#, escape_quotes(name)),
        )
    }

    /// Form field with a text value.
    #[must_use]
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self::field(name, Bytes::from(value.into()))
    }

    /// File upload read from `path` when the message is encoded.
    ///
    /// The length is the file's size at encode time, unknown if it cannot be
    /// stat'ed.
    #[must_use]
    pub fn file(name: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::upload(name, &filename, PartSource::File(path))
    }

    /// Upload from a reader. It can be encoded only once and its length is
    /// never known, which forces chunked transfer.
    #[must_use]
    pub fn stream(
        name: &str,
        filename: &str,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self::upload(name, filename, PartSource::stream(reader))
    }

    fn upload(name: &str, filename: &str, source: PartSource) -> Self {
        Self::new(source)
            .with_header(
                "Content-Disposition",
                format!(
                    r#"form-data; name="{}"; filename="{}""#,
                    escape_quotes(name),
                    escape_quotes(filename)
                ),
            )
            .with_header("Content-Type", OCTET_STREAM)
    }

    /// Append a header value.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.headers
    }

    #[must_use]
    pub fn source(&self) -> &PartSource {
        &self.source
    }

    /// Length of the body alone, `None` if unknown.
    #[must_use]
    pub fn body_len(&self) -> Option<u64> {
        self.source.len()
    }

    /// Length of header lines, blank line, body and trailing CRLF.
    #[must_use]
    pub fn encoded_len(&self) -> Option<u64> {
        Some(self.headers_len() + 2 + self.body_len()? + 2)
    }

    fn headers_len(&self) -> u64 {
        self.headers
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| key.len() + 2 + v.len() + 2))
            .sum::<usize>() as u64
    }

    /// Boundary line, header lines and blank line.
    fn preamble(&self, boundary: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(b"--");
        buf.put_slice(boundary.as_bytes());
        buf.put_slice(CRLF);
        for (key, values) in &self.headers {
            for value in values {
                buf.put_slice(key.as_bytes());
                buf.put_slice(b": ");
                buf.put_slice(value.as_bytes());
                buf.put_slice(CRLF);
            }
        }
        buf.put_slice(CRLF);
        buf.freeze()
    }
}

/// An ordered multipart message with a boundary fixed for its lifetime.
#[derive(Debug)]
pub struct Multipart {
    parts: Vec<Arc<Part>>,
    boundary: String,
    content_type: String,
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

impl Multipart {
    /// Empty message with a random boundary.
    #[must_use]
    pub fn new() -> Self {
        Self::with_boundary(random_boundary())
    }

    /// Empty message with a caller-chosen boundary.
    #[must_use]
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        let boundary = boundary.into();
        let content_type = format!(r#"multipart/form-data; boundary="{boundary}""#);
        Self {
            parts: Vec::new(),
            boundary,
            content_type,
        }
    }

    /// Append a part (builder style).
    #[must_use]
    pub fn part(mut self, part: Part) -> Self {
        self.push(part);
        self
    }

    /// Append a part.
    pub fn push(&mut self, part: Part) {
        self.parts.push(Arc::new(part));
    }

    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `multipart/form-data; boundary="..."`
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn parts(&self) -> &[Arc<Part>] {
        &self.parts
    }

    /// Total encoded length, `None` if any part's length is unknown.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        let boundary = self.boundary.len() as u64;
        let count = self.parts.len() as u64;
        let mut total = count * (2 + boundary + 2) + (2 + boundary + 4);
        for part in &self.parts {
            total += part.encoded_len()?;
        }
        Some(total)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Start encoding on a background task and return the consuming end.
    ///
    /// Dropping the returned stream aborts the producer and closes any open
    /// part source. Must be called within a Tokio runtime.
    #[must_use]
    pub fn reader(&self) -> MultipartStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let finished = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            parts: self.parts.clone(),
            boundary: self.boundary.clone(),
            tx,
            finished: Arc::clone(&finished),
        };
        let task = AbortOnDropHandle::new(tokio::spawn(producer.run()));
        MultipartStream {
            rx: ReceiverStream::new(rx),
            finished,
            terminated: false,
            _task: task,
        }
    }
}

enum Abort {
    /// Consumer went away.
    Closed,
    Io(io::Error),
}

struct Producer {
    parts: Vec<Arc<Part>>,
    boundary: String,
    tx: mpsc::Sender<io::Result<Bytes>>,
    finished: Arc<AtomicBool>,
}

impl Producer {
    async fn run(self) {
        match self.write_all().await {
            Ok(()) => self.finished.store(true, Ordering::Release),
            Err(Abort::Closed) => {
                tracing::debug!(boundary = %self.boundary, "multipart consumer closed early");
            }
            Err(Abort::Io(err)) => {
                tracing::debug!(boundary = %self.boundary, error = %err, "multipart producer failed");
                if self.tx.send(Err(err)).await.is_err() {
                    tracing::debug!("multipart error dropped, consumer already gone");
                }
            }
        }
    }

    async fn write_all(&self) -> Result<(), Abort> {
        for part in &self.parts {
            self.send(part.preamble(&self.boundary)).await?;
            self.write_body(part).await?;
            self.send(Bytes::from_static(CRLF)).await?;
        }
        self.send(Bytes::from(format!("--{}--\r\n", self.boundary)))
            .await
    }

    async fn write_body(&self, part: &Part) -> Result<(), Abort> {
        match &part.source {
            PartSource::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Ok(());
                }
                self.send(bytes.clone()).await
            }
            PartSource::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(Abort::Io)?;
                self.copy(file).await
            }
            PartSource::Stream(slot) => {
                let reader = slot.lock().take().ok_or_else(|| {
                    Abort::Io(io::Error::other(
                        "multipart: body of stream part can only be accessed once",
                    ))
                })?;
                self.copy(reader).await
            }
        }
    }

    /// Copy `reader` into the channel; the reader is dropped on return.
    async fn copy<R: AsyncRead + Unpin>(&self, reader: R) -> Result<(), Abort> {
        let mut chunks = ReaderStream::new(reader);
        while let Some(chunk) = chunks.next().await {
            self.send(chunk.map_err(Abort::Io)?).await?;
        }
        Ok(())
    }

    async fn send(&self, bytes: Bytes) -> Result<(), Abort> {
        self.tx.send(Ok(bytes)).await.map_err(|_| Abort::Closed)
    }
}

/// Consuming end of a multipart encoder.
///
/// Yields the encoded message chunk by chunk. Ends with an error, not a
/// silent end of stream, if the producer fails or stops early.
pub struct MultipartStream {
    rx: ReceiverStream<io::Result<Bytes>>,
    finished: Arc<AtomicBool>,
    terminated: bool,
    _task: AbortOnDropHandle<()>,
}

impl MultipartStream {
    /// Adapt the stream into an `AsyncRead`.
    #[must_use]
    pub fn into_async_read(self) -> StreamReader<Self, Bytes> {
        StreamReader::new(self)
    }
}

impl fmt::Debug for MultipartStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartStream")
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Stream for MultipartStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => {
                self.terminated = true;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                self.terminated = true;
                if self.finished.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "multipart producer stopped before the closing boundary",
                    ))))
                }
            }
        }
    }
}
