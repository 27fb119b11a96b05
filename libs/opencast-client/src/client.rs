use crate::body::RequestBody;
use crate::builder::ClientBuilder;
use crate::config::TransportSecurity;
use crate::error::HttpError;
use crate::request::{Request, RequestOpt, with_accept};
use crate::resolver::ServiceResolver;
use crate::response::{HttpResponse, ResponseBody};
use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tower::Service;
use tower::buffer::Buffer;
use url::Url;

/// Type alias for the future type of the inner service
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

/// Buffer<Req, F> in tower 0.5 where Req is the request type and F is the service future type
pub type BufferedService = Buffer<http::Request<RequestBody>, ServiceFuture>;

/// Executes [`Request`]s.
///
/// Implemented by [`Client`] and by wrappers such as [`VersionedClient`];
/// [`pipeline`](crate::pipeline) and the registry-backed resolver work with any
/// implementation.
#[async_trait]
pub trait Execute: Send + Sync {
    /// Send `request` and return the response whatever its status.
    ///
    /// # Errors
    ///
    /// Construction, resolution, transport and cancellation errors.
    async fn execute(&self, request: Request) -> Result<HttpResponse, HttpError>;
}

#[async_trait]
impl<E: Execute + ?Sized> Execute for Arc<E> {
    async fn execute(&self, request: Request) -> Result<HttpResponse, HttpError> {
        (**self).execute(request).await
    }
}

/// Opencast HTTP client.
///
/// Resolves each request's logical service to a host, then sends it through a
/// tower stack (timeout, `User-Agent`, response decompression, optional
/// concurrency limit) over a pooled hyper client.
///
/// `Client` is `Clone + Send + Sync`; clones share the connection pool and the
/// resolver. Non-2xx responses are returned as `Ok`; use
/// [`HttpResponse::classify`] or [`pipeline`](crate::pipeline) to turn them
/// into errors.
#[derive(Clone)]
pub struct Client {
    pub(crate) service: BufferedService,
    pub(crate) resolver: Arc<dyn ServiceResolver>,
    pub(crate) default_options: Arc<[RequestOpt]>,
    pub(crate) max_body_size: usize,
    pub(crate) transport_security: TransportSecurity,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("default_options", &self.default_options.len())
            .field("max_body_size", &self.max_body_size)
            .field("transport_security", &self.transport_security)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a builder for a client resolving services with `resolver`
    #[must_use]
    pub fn builder(resolver: impl ServiceResolver + 'static) -> ClientBuilder {
        ClientBuilder::new(resolver)
    }

    /// Execute `request`.
    ///
    /// The client's default options are applied after the request's own. The
    /// call is abandoned with `HttpError::Cancelled` once the request's
    /// cancellation token fires; dropping the future cancels it as well.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` if:
    /// - a default option fails
    /// - the service cannot be resolved
    /// - the URL or its scheme is invalid for the transport security mode
    /// - network/transport error or request timeout
    /// - the concurrency limit or request buffer is full (`Overloaded`)
    pub async fn execute(&self, mut request: Request) -> Result<HttpResponse, HttpError> {
        request.apply(&self.default_options)?;

        let Some(token) = request.cancellation().cloned() else {
            return self.send(request).await;
        };
        let service = request.service().to_owned();
        tokio::select! {
            biased;
            () = token.cancelled() => {
                tracing::debug!(service, "request cancelled");
                Err(HttpError::Cancelled)
            }
            result = self.send(request) => result,
        }
    }

    async fn send(&self, request: Request) -> Result<HttpResponse, HttpError> {
        let base = self.resolver.resolve(request.service()).await?;
        let url = request.url(&base)?;
        self.check_scheme(&url)?;

        let service = request.service().to_owned();
        let (method, mut headers, content, _) = request.into_parts();

        if let Some(content_type) = content.content_type()
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type)?);
        }
        let body = RequestBody::new(content.reader()?, content.len());
        drop(content);

        let mut outbound = http::Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .body(body)?;
        *outbound.headers_mut() = headers;

        let mut service_handle = self.service.clone();
        try_acquire_buffer_slot(&mut service_handle).await?;

        let started = Instant::now();
        let result = service_handle.call(outbound).await.map_err(map_buffer_error);
        let duration = started.elapsed();

        match &result {
            Ok(response) => tracing::debug!(
                service,
                %method,
                url = %url,
                status = response.status().as_u16(),
                ?duration,
                "request completed"
            ),
            Err(err) => tracing::debug!(
                service,
                %method,
                url = %url,
                error = %err,
                ?duration,
                "request failed"
            ),
        }

        Ok(HttpResponse::new(result?, self.max_body_size, duration))
    }

    fn check_scheme(&self, url: &Url) -> Result<(), HttpError> {
        match url.scheme() {
            "https" => Ok(()),
            "http" => match self.transport_security {
                TransportSecurity::AllowInsecureHttp => Ok(()),
                TransportSecurity::TlsOnly => Err(HttpError::InvalidScheme {
                    scheme: "http".to_owned(),
                    reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
                }),
            },
            scheme => Err(HttpError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "only http:// and https:// schemes are supported".to_owned(),
            }),
        }
    }
}

#[async_trait]
impl Execute for Client {
    async fn execute(&self, request: Request) -> Result<HttpResponse, HttpError> {
        Client::execute(self, request).await
    }
}

/// Executor pinning the API version through the `Accept` header.
///
/// The Opencast external API selects its version from the media type, e.g.
/// `application/v1.11.0+json`.
#[derive(Debug, Clone)]
pub struct VersionedClient<E> {
    inner: E,
    accept: RequestOpt,
    version: String,
}

impl<E: Execute> VersionedClient<E> {
    /// Wrap `inner` so every request asks for `application/<version>+json`
    #[must_use]
    pub fn new(inner: E, version: &str) -> Self {
        Self {
            inner,
            accept: with_accept(format!("application/{version}+json")),
            version: version.to_owned(),
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: Execute> Execute for VersionedClient<E> {
    async fn execute(&self, mut request: Request) -> Result<HttpResponse, HttpError> {
        self.accept.apply(&mut request)?;
        self.inner.execute(request).await
    }
}

/// Map buffer errors to `HttpError`
///
/// Buffer can return `ServiceError` which wraps the inner service error,
/// or `Closed` if the buffer worker has shut down.
fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            HttpError::ServiceClosed
        }
    }
}

/// Try to acquire a buffer slot with fail-fast semantics.
///
/// If the buffer is full, returns `HttpError::Overloaded` immediately instead
/// of blocking.
async fn try_acquire_buffer_slot(service: &mut BufferedService) -> Result<(), HttpError> {
    use std::task::Poll;

    let poll_result = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match poll_result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(HttpError::Overloaded),
    }
}
