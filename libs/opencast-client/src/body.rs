//! Outbound request payloads.
//!
//! [`Body`] is a closed set of payload kinds sharing one capability set:
//! declared length ([`Body::len`], `None` when unknown), a fresh byte stream
//! ([`Body::reader`]) and an optional content type ([`Body::content_type`]).
//! Every variant except multipart messages with stream parts can be read any
//! number of times and yields the same bytes each time.

use crate::error::{EncodeError, HttpError};
use crate::multipart::Multipart;
use bytes::Bytes;
use futures::stream::{self, Stream};
use http_body::{Frame, SizeHint};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

/// Content type of URL-encoded form bodies.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Content type of JSON bodies built with [`Body::json`].
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A readable byte stream produced by [`Body::reader`].
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

type Encoder = Box<dyn Fn() -> Result<Bytes, EncodeError> + Send + Sync>;

/// Request payload.
#[derive(Debug, Default)]
pub enum Body {
    /// No payload.
    #[default]
    Empty,
    /// In-memory bytes or text.
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
    /// A value encoded on first use.
    Encoded(EncodedBody),
    /// `application/x-www-form-urlencoded` fields.
    Form(FormBody),
    /// Streaming `multipart/form-data` message.
    Multipart(Multipart),
}

impl Body {
    /// Empty body: length 0, no content type.
    #[must_use]
    pub fn empty() -> Self {
        Body::Empty
    }

    /// In-memory bytes with an optional content type.
    #[must_use]
    pub fn bytes(data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Body::Bytes {
            data: data.into(),
            content_type: content_type.map(ToOwned::to_owned),
        }
    }

    /// In-memory text with an optional content type.
    #[must_use]
    pub fn text(text: impl Into<String>, content_type: Option<&str>) -> Self {
        Body::bytes(Bytes::from(text.into()), content_type)
    }

    /// JSON-encoded value, serialized lazily with `serde_json`.
    #[must_use]
    pub fn json<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Body::Encoded(EncodedBody::new(value, JSON_CONTENT_TYPE, |v: &T| {
            serde_json::to_vec(v)
        }))
    }

    /// A value paired with its encoder, run at most once.
    #[must_use]
    pub fn encoded<T, F, E>(value: T, content_type: &str, encode: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<Vec<u8>, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Body::Encoded(EncodedBody::new(value, content_type, encode))
    }

    /// URL-encoded form.
    #[must_use]
    pub fn form(form: FormBody) -> Self {
        Body::Form(form)
    }

    /// Streaming multipart message.
    #[must_use]
    pub fn multipart(multipart: Multipart) -> Self {
        Body::Multipart(multipart)
    }

    /// Declared length in bytes, `None` when it cannot be known in advance.
    ///
    /// An unknown length makes the transport use chunked transfer encoding.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes { data, .. } => Some(data.len() as u64),
            Body::Encoded(encoded) => encoded.len(),
            Body::Form(form) => Some(form.encoded().len() as u64),
            Body::Multipart(multipart) => multipart.len(),
        }
    }

    /// Whether the body is known to be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Content type to send, `None` when the header should not be set.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        match self {
            Body::Empty => None,
            Body::Bytes { content_type, .. } => content_type.as_deref(),
            Body::Encoded(encoded) => Some(&encoded.content_type),
            Body::Form(_) => Some(FORM_CONTENT_TYPE),
            Body::Multipart(multipart) => Some(multipart.content_type()),
        }
    }

    /// Open a fresh stream over the body's bytes.
    ///
    /// Multipart bodies start their producer task here, so this must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::Encode` when a lazily encoded value failed to encode.
    /// Multipart failures surface later, as errors on the returned stream.
    pub fn reader(&self) -> Result<BodyStream, HttpError> {
        match self {
            Body::Empty => Ok(Box::pin(stream::empty())),
            Body::Bytes { data, .. } => Ok(once(data.clone())),
            Body::Encoded(encoded) => encoded.bytes().map(once),
            Body::Form(form) => Ok(once(form.encoded())),
            Body::Multipart(multipart) => Ok(Box::pin(multipart.reader())),
        }
    }
}

impl From<EncodedBody> for Body {
    fn from(encoded: EncodedBody) -> Self {
        Body::Encoded(encoded)
    }
}

impl From<FormBody> for Body {
    fn from(form: FormBody) -> Self {
        Body::Form(form)
    }
}

impl From<Multipart> for Body {
    fn from(multipart: Multipart) -> Self {
        Body::Multipart(multipart)
    }
}

fn once(data: Bytes) -> BodyStream {
    if data.is_empty() {
        return Box::pin(stream::empty());
    }
    Box::pin(stream::once(async move { Ok(data) }))
}

/// A value whose encoding is deferred until the body is first measured or read.
///
/// The result, including a failure, is memoized: the encoder never runs twice.
pub struct EncodedBody {
    content_type: String,
    encoder: Encoder,
    encoded: OnceLock<Result<Bytes, EncodeError>>,
}

impl EncodedBody {
    #[must_use]
    pub fn new<T, F, E>(value: T, content_type: &str, encode: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<Vec<u8>, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let encoder: Encoder = Box::new(move || {
            encode(&value).map(Bytes::from).map_err(|e| {
                let shared: Arc<dyn std::error::Error + Send + Sync> = Arc::new(e);
                EncodeError::from(shared)
            })
        });
        Self {
            content_type: content_type.to_owned(),
            encoder,
            encoded: OnceLock::new(),
        }
    }

    fn result(&self) -> &Result<Bytes, EncodeError> {
        self.encoded.get_or_init(|| (self.encoder)())
    }

    /// Encoded length, `None` when encoding failed.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.result().as_ref().ok().map(|b| b.len() as u64)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns the memoized `HttpError::Encode` when encoding failed.
    pub fn bytes(&self) -> Result<Bytes, HttpError> {
        match self.result() {
            Ok(bytes) => Ok(bytes.clone()),
            Err(err) => Err(HttpError::Encode(err.clone())),
        }
    }
}

impl fmt::Debug for EncodedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedBody")
            .field("content_type", &self.content_type)
            .field("encoded", &self.encoded.get().map(Result::is_ok))
            .finish_non_exhaustive()
    }
}

/// URL-encoded form fields.
///
/// Keys are encoded in sorted order, values in insertion order. The form is
/// finalized the first time it is measured or read; it must not be mutated
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct FormBody {
    fields: BTreeMap<String, Vec<String>>,
    encoded: OnceLock<Bytes>,
}

impl FormBody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a form from any value `serde_urlencoded` can serialize.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::FormEncode` if the value is not a flat sequence of pairs.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, HttpError> {
        let encoded = serde_urlencoded::to_string(value)?;
        let mut form = Self::new();
        for (key, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            form.add(key, value);
        }
        Ok(form)
    }

    /// Replace all values of `key`.
    ///
    /// # Panics
    ///
    /// Panics if the form has already been encoded.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.assert_mutable();
        self.fields.insert(key.into(), vec![value.into()]);
        self
    }

    /// Append a value to `key`.
    ///
    /// # Panics
    ///
    /// Panics if the form has already been encoded.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.assert_mutable();
        self.fields.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Remove `key` and all of its values.
    ///
    /// # Panics
    ///
    /// Panics if the form has already been encoded.
    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.assert_mutable();
        self.fields.remove(key);
        self
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of `key`, in insertion order.
    #[must_use]
    pub fn values(&self, key: &str) -> &[String] {
        self.fields.get(key).map_or(&[], Vec::as_slice)
    }

    /// Encode the form, finalizing it.
    #[must_use]
    pub fn encoded(&self) -> Bytes {
        self.encoded
            .get_or_init(|| {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, values) in &self.fields {
                    for value in values {
                        serializer.append_pair(key, value);
                    }
                }
                Bytes::from(serializer.finish())
            })
            .clone()
    }

    fn assert_mutable(&self) {
        assert!(
            self.encoded.get().is_none(),
            "form body mutated after it was encoded"
        );
    }
}

/// `http_body::Body` adapter over a [`BodyStream`].
///
/// Reports an exact size hint when the declared length is known, which lets the
/// transport send `Content-Length`; otherwise the request is sent chunked.
pub struct RequestBody {
    stream: BodyStream,
    len: Option<u64>,
}

impl RequestBody {
    #[must_use]
    pub fn new(stream: BodyStream, len: Option<u64>) -> Self {
        Self { stream, len }
    }

    /// Empty request body.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Box::pin(stream::empty()), Some(0))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl http_body::Body for RequestBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.len == Some(0)
    }

    fn size_hint(&self) -> SizeHint {
        match self.len {
            Some(len) => SizeHint::with_exact(len),
            None => SizeHint::default(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::multipart::Part;
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn read_all(body: &Body) -> Result<Vec<u8>, io::Error> {
        let stream = body.reader().map_err(io::Error::other)?;
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[derive(Debug)]
    struct Refused;

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("value refused")
        }
    }

    impl std::error::Error for Refused {}

    // -- empty ---

    #[tokio::test]
    async fn test_empty_body() {
        let body = Body::empty();
        assert_eq!(body.len(), Some(0));
        assert!(body.is_empty());
        assert_eq!(body.content_type(), None);
        assert!(read_all(&body).await.unwrap().is_empty());
    }

    // -- replayable readers ---

    #[tokio::test]
    async fn test_replayable_bodies_yield_identical_bytes() {
        let mut form = FormBody::new();
        form.set("title", "Lecture 1").add("tag", "a").add("tag", "b");

        let bodies = vec![
            Body::bytes(&b"\x00\x01binary"[..], Some("application/octet-stream")),
            Body::text("plain text", Some("text/plain")),
            Body::json(serde_json::json!({"id": "abc", "n": 3})),
            Body::form(form),
            Body::multipart(
                Multipart::with_boundary("b0undary")
                    .part(Part::text("a", "1"))
                    .part(Part::field("b", &b"2"[..])),
            ),
        ];

        for body in &bodies {
            let first = read_all(body).await.unwrap();
            let second = read_all(body).await.unwrap();
            assert_eq!(first, second, "{body:?}");
            assert_eq!(Some(first.len() as u64), body.len(), "{body:?}");
        }
    }

    #[test]
    fn test_text_content_type() {
        assert_eq!(Body::text("x", None).content_type(), None);
        assert_eq!(
            Body::text("x", Some("text/plain")).content_type(),
            Some("text/plain")
        );
        assert_eq!(Body::text("h\u{e9}llo", None).len(), Some(6));
    }

    // -- lazy encoding ---

    #[tokio::test]
    async fn test_encoder_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let body = Body::encoded(42_u32, "text/plain", move |v: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(v.to_string().into_bytes())
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(body.len(), Some(2));
        assert_eq!(body.len(), Some(2));
        assert_eq!(read_all(&body).await.unwrap(), b"42");
        assert_eq!(read_all(&body).await.unwrap(), b"42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(body.content_type(), Some("text/plain"));
    }

    #[test]
    fn test_encoder_failure_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let body = Body::encoded((), "application/json", move |_: &()| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Vec<u8>, _>(Refused)
        });

        let first = body.reader().err().unwrap();
        assert!(matches!(first, HttpError::Encode(_)));
        assert_eq!(body.len(), None);
        let second = body.reader().err().unwrap();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_json_body() {
        #[derive(Serialize)]
        struct Event {
            title: &'static str,
        }

        let body = Body::json(Event { title: "Intro" });
        assert_eq!(body.content_type(), Some(JSON_CONTENT_TYPE));
        assert_eq!(read_all(&body).await.unwrap(), br#"{"title":"Intro"}"#);
    }

    // -- form ---

    #[test]
    fn test_form_operations() {
        let mut form = FormBody::new();
        form.set("a", "1").add("a", "2").set("b", "x y").add("c", "&");

        assert!(form.has("a"));
        assert_eq!(form.get("a"), Some("1"));
        assert_eq!(form.values("a"), ["1", "2"]);

        form.set("a", "3").delete("c");
        assert!(!form.has("c"));
        assert!(form.values("missing").is_empty());

        assert_eq!(&form.encoded()[..], b"a=3&b=x+y");
    }

    #[test]
    fn test_form_sorted_keys() {
        let mut form = FormBody::new();
        form.add("z", "last").add("m", "mid").add("a", "first");
        let body = Body::form(form);
        assert_eq!(body.content_type(), Some(FORM_CONTENT_TYPE));
        assert_eq!(body.len(), Some(20));
    }

    #[test]
    fn test_form_from_serialize() {
        let form = FormBody::from_serialize(&[("role", "ROLE_ADMIN"), ("role", "ROLE_USER")])
            .unwrap();
        assert_eq!(form.values("role"), ["ROLE_ADMIN", "ROLE_USER"]);
    }

    #[test]
    #[should_panic(expected = "form body mutated after it was encoded")]
    fn test_form_mutation_after_encoding_panics() {
        let mut form = FormBody::new();
        form.set("a", "1");
        let _encoded = form.encoded();
        form.set("b", "2");
    }

    // -- request body ---

    #[test]
    fn test_request_body_size_hint() {
        use http_body::Body as _;

        let known = RequestBody::new(once(Bytes::from_static(b"abc")), Some(3));
        assert_eq!(known.size_hint().exact(), Some(3));
        assert!(!known.is_end_stream());

        let unknown = RequestBody::new(once(Bytes::from_static(b"abc")), None);
        assert_eq!(unknown.size_hint().exact(), None);

        assert!(RequestBody::empty().is_end_stream());
    }

    #[tokio::test]
    async fn test_request_body_frames() {
        use http_body_util::BodyExt;

        let body = RequestBody::new(once(Bytes::from_static(b"payload")), Some(7));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"payload");
    }
}
