use crate::error::HttpError;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Type alias for the boxed response body that supports decompression.
///
/// This type can hold either a raw body or a decompressed body (gzip/br/deflate).
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

pin_project! {
    /// Body wrapper that enforces size limits during streaming.
    ///
    /// Created by [`HttpResponse::into_limited_body()`]. Tracks bytes read
    /// and returns [`HttpError::BodyTooLarge`] if the limit is exceeded.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    /// Returns the number of bytes read so far.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(HttpError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(HttpError::Transport(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Structured-data family selected from a response's media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFamily {
    /// `application/json`, `application/*+json`
    Json,
    /// `application/xml`, `text/xml`, `application/*+xml`
    Xml,
}

impl MediaFamily {
    /// Pick the decoder family for a `Content-Type` value. Parameters are ignored.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidContentType` if the value does not parse as a
    /// media type and `HttpError::UnsupportedMediaType` for anything but JSON or XML.
    pub fn sniff(content_type: &str) -> Result<Self, HttpError> {
        let media: mime::Mime = content_type.parse().map_err(|e: mime::FromStrError| {
            HttpError::InvalidContentType(format!("'{content_type}': {e}"))
        })?;

        let application = media.type_() == mime::APPLICATION;
        if application && (media.subtype() == mime::JSON || media.suffix() == Some(mime::JSON)) {
            return Ok(MediaFamily::Json);
        }
        let xml = media.subtype() == mime::XML;
        if (application && (xml || media.suffix() == Some(mime::XML)))
            || (media.type_() == mime::TEXT && xml)
        {
            return Ok(MediaFamily::Xml);
        }
        Err(HttpError::UnsupportedMediaType(
            media.essence_str().to_owned(),
        ))
    }

    /// Family for the `Content-Type` header of a response.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidContentType` when the header is missing or not
    /// text, otherwise the errors of [`sniff`](Self::sniff).
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, HttpError> {
        let value = headers
            .get(http::header::CONTENT_TYPE)
            .ok_or_else(|| HttpError::InvalidContentType("missing Content-Type header".to_owned()))?
            .to_str()
            .map_err(|e| HttpError::InvalidContentType(e.to_string()))?;
        Self::sniff(value)
    }

    /// Deserialize `bytes` with this family's decoder.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::Json` or `HttpError::Xml` for malformed input.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, HttpError> {
        match self {
            MediaFamily::Json => Ok(serde_json::from_slice(bytes)?),
            MediaFamily::Xml => Ok(quick_xml::de::from_reader(bytes)?),
        }
    }
}

/// Status, headers and timing of a completed call.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Wall-clock time from dispatch until response headers arrived.
    pub duration: Duration,
}

/// HTTP response wrapper with body-reading helpers
///
/// - `resp.classify()?` - map non-2xx statuses to errors, keeping the response
/// - `resp.bytes().await?` - read raw bytes
/// - `resp.decode_auto::<T>().await?` - decode JSON or XML by `Content-Type`
///
/// Body reads do not check the status and enforce the configured `max_body_size`.
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
    pub(crate) duration: Duration,
}

impl HttpResponse {
    /// Wrap a raw response, e.g. one produced by a custom executor.
    #[must_use]
    pub fn new(inner: Response<ResponseBody>, max_body_size: usize, duration: Duration) -> Self {
        Self {
            inner,
            max_body_size,
            duration,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Wall-clock duration of the call.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            status: self.status(),
            headers: self.headers().clone(),
            duration: self.duration,
        }
    }

    /// Consume the wrapper and return the inner response with boxed body
    ///
    /// The body has already been through the decompression layer.
    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }

    /// Classify the response by status.
    ///
    /// # Errors
    ///
    /// - `HttpError::Status` for statuses >= 400, displayed as the canonical
    ///   reason phrase, or as the bare code (`"599"`) when the status has none
    /// - `HttpError::UnexpectedStatus` for any other non-2xx status
    ///
    /// Both errors carry the response.
    pub fn classify(self) -> Result<Self, HttpError> {
        let status = self.status();
        if status.is_success() {
            return Ok(self);
        }
        if status.as_u16() >= 400 {
            let reason = status
                .canonical_reason()
                .map_or_else(|| status.as_str().to_owned(), ToOwned::to_owned);
            return Err(HttpError::Status {
                status,
                reason,
                response: Box::new(self),
            });
        }
        Err(HttpError::UnexpectedStatus {
            status,
            response: Box::new(self),
        })
    }

    /// Read response body as bytes
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if body exceeds limit.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        read_body_limited(self.inner, self.max_body_size).await
    }

    /// Parse response body as JSON
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if body exceeds limit.
    /// Returns `HttpError::Json` if parsing fails.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let body = self.bytes().await?;
        MediaFamily::Json.decode(&body)
    }

    /// Parse response body as XML
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if body exceeds limit.
    /// Returns `HttpError::Xml` if parsing fails.
    pub async fn xml<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let body = self.bytes().await?;
        MediaFamily::Xml.decode(&body)
    }

    /// Decode the body as JSON or XML, chosen by the `Content-Type` header.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidContentType` or `HttpError::UnsupportedMediaType`
    /// before reading the body when the media type is not JSON or XML.
    /// Returns body read and decode errors otherwise.
    pub async fn decode_auto<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let family = MediaFamily::from_headers(self.headers())?;
        let body = self.bytes().await?;
        family.decode(&body)
    }

    /// Read response body as text (UTF-8, lossy)
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if body exceeds limit.
    pub async fn text(self) -> Result<String, HttpError> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Returns the response body as a stream without a size limit.
    ///
    /// Prefer [`into_limited_body()`](Self::into_limited_body) for untrusted
    /// responses.
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.inner.into_body()
    }

    /// Returns the response body as a size-limited stream.
    ///
    /// The limit is enforced on decompressed bytes.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.inner.into_body(), self.max_body_size)
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

/// Read a (possibly decompressed) response body, failing once `limit` bytes
/// are exceeded.
async fn read_body_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, HttpError> {
    let (_parts, body) = response.into_parts();

    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(HttpError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::Full;
    use serde::Deserialize;

    fn response(status: u16, content_type: Option<&str>, body: &'static str) -> HttpResponse {
        let mut builder = Response::builder().status(status);
        if let Some(ct) = content_type {
            builder = builder.header(http::header::CONTENT_TYPE, ct);
        }
        let body: ResponseBody = Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
            .boxed();
        HttpResponse::new(builder.body(body).unwrap(), 1024, Duration::from_millis(5))
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Series {
        identifier: String,
        title: String,
    }

    // -- classify ---

    #[test]
    fn test_classify_success() {
        let resp = response(204, None, "").classify().unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_classify_not_found_keeps_response() {
        let err = response(404, Some("text/plain"), "no such event")
            .classify()
            .unwrap_err();
        assert_eq!(err.to_string(), "Not Found");
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));

        let resp = err.into_response().unwrap();
        assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/plain");
        assert_eq!(resp.text().await.unwrap(), "no such event");
    }

    #[test]
    fn test_classify_unexpected_status() {
        let err = response(302, None, "").classify().unwrap_err();
        assert!(matches!(
            err,
            HttpError::UnexpectedStatus { status, .. } if status == StatusCode::FOUND
        ));
        assert!(err.response().is_some());
    }

    #[test]
    fn test_classify_uncommon_error_status() {
        let err = response(599, None, "").classify().unwrap_err();
        assert!(matches!(err, HttpError::Status { .. }));
        assert_eq!(err.to_string(), "599");
    }

    // -- media families ---

    #[test]
    fn test_sniff_media_families() {
        let cases = [
            ("application/json", MediaFamily::Json),
            ("application/json; charset=utf-8", MediaFamily::Json),
            ("application/v1.11.0+json", MediaFamily::Json),
            ("application/vnd.example.v1+json", MediaFamily::Json),
            ("application/xml", MediaFamily::Xml),
            ("text/xml; charset=UTF-8", MediaFamily::Xml),
            ("application/atom+xml", MediaFamily::Xml),
        ];
        for (content_type, expected) in cases {
            assert_eq!(MediaFamily::sniff(content_type).unwrap(), expected, "{content_type}");
        }
    }

    #[test]
    fn test_sniff_rejects_other_types() {
        for content_type in ["text/plain", "text/json", "image/svg+xml", "text/html"] {
            let err = MediaFamily::sniff(content_type).unwrap_err();
            assert!(
                matches!(err, HttpError::UnsupportedMediaType(ref t) if t == content_type),
                "{content_type}: {err}"
            );
        }
        assert!(matches!(
            MediaFamily::sniff("not a media type"),
            Err(HttpError::InvalidContentType(_))
        ));
        assert!(matches!(
            MediaFamily::from_headers(&HeaderMap::new()),
            Err(HttpError::InvalidContentType(_))
        ));
    }

    // -- decoding ---

    #[tokio::test]
    async fn test_decode_auto_json() {
        let series: Series = response(
            200,
            Some("application/v1.11.0+json"),
            r#"{"identifier":"s1","title":"Physics"}"#,
        )
        .decode_auto()
        .await
        .unwrap();
        assert_eq!(series.title, "Physics");
    }

    #[tokio::test]
    async fn test_decode_auto_xml() {
        let series: Series = response(
            200,
            Some("text/xml"),
            "<series><identifier>s1</identifier><title>Physics</title></series>",
        )
        .decode_auto()
        .await
        .unwrap();
        assert_eq!(
            series,
            Series {
                identifier: "s1".to_owned(),
                title: "Physics".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_decode_auto_unsupported() {
        let err = response(200, Some("text/plain"), "hello")
            .decode_auto::<Series>()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported media type: text/plain");
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let err = response(200, Some("application/json"), "{")
            .decode_auto::<Series>()
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Json(_)));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let body = "x".repeat(2048).leak();
        let err = response(200, None, body).bytes().await.unwrap_err();
        assert!(matches!(err, HttpError::BodyTooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn test_limited_body_stream() {
        let mut body = response(200, None, "0123456789").into_limited_body();
        let mut total = 0;
        while let Some(frame) = body.frame().await {
            total += frame.unwrap().into_data().map_or(0, |d| d.len());
        }
        assert_eq!(total, 10);
        assert_eq!(body.bytes_read(), 10);
    }

    #[test]
    fn test_meta() {
        let meta = response(200, Some("application/json"), "{}").meta();
        assert_eq!(meta.status, StatusCode::OK);
        assert_eq!(meta.duration, Duration::from_millis(5));
        assert!(meta.headers.contains_key(http::header::CONTENT_TYPE));
    }
}
