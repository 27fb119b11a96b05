use crate::response::{HttpResponse, ResponseMeta};
use http::StatusCode;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a resolved base URL was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// Not a URL at all
    ParseError,
    /// No host, e.g. `file:///srv` or `http://`
    MissingAuthority,
    /// A bare path or host name without `http://`/`https://`
    MissingScheme,
}

/// Cloneable handle to an error handed out to more than one caller.
///
/// Derefs to the wrapped error instead of implementing `Error` itself, so the
/// `source()` of the enclosing [`HttpError`] is the wrapped error and can be
/// downcast to its concrete type.
#[derive(Debug)]
pub struct SharedError<E: ?Sized = dyn std::error::Error + Send + Sync>(Arc<E>);

impl<E: ?Sized> Clone for SharedError<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E: ?Sized> From<Arc<E>> for SharedError<E> {
    fn from(inner: Arc<E>) -> Self {
        Self(inner)
    }
}

impl<E: ?Sized> Deref for SharedError<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

impl<E: ?Sized + fmt::Display> fmt::Display for SharedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Memoized body encoding failure, returned on every read of the body.
pub type EncodeError = SharedError;

/// Opencast client error types
///
/// Grouped by the stage that produced them:
/// - construction: `RequestBuild`, `InvalidHeader*`, `InvalidUri`, `InvalidScheme`,
///   `Encode`, `FormEncode`
/// - resolution: `ServiceNotFound`, `NoAvailableHosts`, `Registry`
/// - transport: `Timeout`, `Transport`, `Tls`, `Cancelled`, `Overloaded`, `ServiceClosed`
/// - protocol: `Status`, `UnexpectedStatus`, `BodyTooLarge`
/// - decoding: `InvalidContentType`, `UnsupportedMediaType`, `Json`, `Xml`,
///   and `Decode`, which wraps any of them together with the response metadata
///
/// Nothing is retried by this crate; callers decide based on the variant.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// `http::Request` assembly failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// A header option named an invalid header
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// A header option carried a value that is not a valid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Invalid URL (failed to parse or join)
    ///
    /// Match on `kind`; `reason` is for logs only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// Base URL as returned by the resolver
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// The resolved host uses a scheme the transport settings forbid
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme {
        scheme: String,
        reason: String,
    },

    /// A request body could not be encoded
    #[error("Body encoding failed: {0}")]
    Encode(#[source] EncodeError),

    /// `FormBody::from_serialize` got a value that is not a flat list of pairs
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// The logical service is unknown (static table or service registry)
    #[error("Service not found: {service}")]
    ServiceNotFound {
        /// Logical service identifier
        service: String,
    },

    /// The service is known to the registry but has no registered hosts
    #[error("No available hosts for service '{service}'")]
    NoAvailableHosts {
        /// Logical service identifier
        service: String,
    },

    /// The service registry could not be queried
    #[error("Service registry lookup for '{service}' failed: {source}")]
    Registry {
        /// Logical service identifier being resolved
        service: String,
        /// Underlying failure of the registry call
        ///
        /// Shared by every caller that waited on the same registry query.
        #[source]
        source: SharedError<HttpError>,
    },

    /// Request timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, body streaming)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Root store or rustls configuration failure
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The request's cancellation token fired before the call completed
    #[error("Request cancelled")]
    Cancelled,

    /// Concurrency cap or request queue full; the request was not sent
    #[error("Service overloaded: concurrency limit reached")]
    Overloaded,

    /// The client's background worker is gone
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// Response body larger than the client's `max_body_size`
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// HTTP status >= 400
    ///
    /// Displays as the canonical reason phrase ("Not Found"), or as the numeric
    /// code for statuses without one. The response is kept so headers and body
    /// stay inspectable.
    #[error("{reason}")]
    Status {
        status: StatusCode,
        reason: String,
        response: Box<HttpResponse>,
    },

    /// Any other non-2xx status (1xx, 3xx)
    #[error("Unexpected status code: {status}")]
    UnexpectedStatus {
        status: StatusCode,
        response: Box<HttpResponse>,
    },

    /// Response has no usable `Content-Type` header
    #[error("Invalid content type: {0}")]
    InvalidContentType(String),

    /// Response media type is neither JSON nor XML
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Body sniffed as JSON did not decode into the target type
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Body sniffed as XML did not decode into the target type
    #[error("XML parsing failed: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// A successful response whose body could not be read or decoded
    ///
    /// Returned by the decoding pipeline so the status, headers and timing of
    /// the response are not lost.
    #[error("Failed to decode response: {source}")]
    Decode {
        meta: Box<ResponseMeta>,
        #[source]
        source: Box<HttpError>,
    },
}

impl HttpError {
    /// HTTP status carried by protocol-level errors.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } | HttpError::UnexpectedStatus { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Response returned alongside a protocol-level error.
    #[must_use]
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            HttpError::Status { response, .. } | HttpError::UnexpectedStatus { response, .. } => {
                Some(response)
            }
            _ => None,
        }
    }

    /// Metadata of the response whose body failed to decode.
    #[must_use]
    pub fn meta(&self) -> Option<&ResponseMeta> {
        match self {
            HttpError::Decode { meta, .. } => Some(meta),
            _ => None,
        }
    }

    /// Take ownership of the response returned alongside a protocol-level error.
    #[must_use]
    pub fn into_response(self) -> Option<HttpResponse> {
        match self {
            HttpError::Status { response, .. } | HttpError::UnexpectedStatus { response, .. } => {
                Some(*response)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn test_transport_error_preserves_source() {
        let err = HttpError::Transport(Box::new(TestError("connection refused")));

        let source = err.source().unwrap();
        let downcast = source.downcast_ref::<TestError>().unwrap();
        assert_eq!(downcast.0, "connection refused");
    }

    #[test]
    fn test_encode_error_is_shared() {
        let concrete: Arc<dyn Error + Send + Sync> = Arc::new(TestError("bad value"));
        let inner = EncodeError::from(concrete);
        let first = HttpError::Encode(inner.clone());
        let second = HttpError::Encode(inner.clone());

        assert_eq!(first.to_string(), "Body encoding failed: bad value");
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(Arc::strong_count(&inner.0), 3);

        let source = first.source().unwrap();
        assert_eq!(source.downcast_ref::<TestError>().unwrap().0, "bad value");
        assert!(source.source().is_none());
    }

    #[test]
    fn test_registry_error_chain() {
        let err = HttpError::Registry {
            service: "org.opencastproject.search".to_owned(),
            source: Arc::new(HttpError::Transport(Box::new(TestError("root cause")))).into(),
        };
        assert!(matches!(
            err.source().unwrap().downcast_ref::<HttpError>(),
            Some(HttpError::Transport(_))
        ));

        let mut count = 0;
        let mut current: Option<&(dyn Error + 'static)> = Some(&err);
        while let Some(e) = current {
            count += 1;
            current = e.source();
        }
        assert_eq!(count, 3, "Registry -> Transport -> TestError");
    }

    #[test]
    fn test_resolution_errors_display_service() {
        let err = HttpError::ServiceNotFound {
            service: "org.opencastproject.search".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "Service not found: org.opencastproject.search"
        );
        assert!(err.response().is_none());
        assert!(err.status().is_none());
    }
}
