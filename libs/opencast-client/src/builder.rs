use crate::body::RequestBody;
use crate::client::{BufferedService, Client};
use crate::config::{ClientConfig, RateLimitConfig, TlsRootConfig, TransportSecurity};
use crate::error::HttpError;
use crate::layers::UserAgentLayer;
use crate::request::RequestOpt;
use crate::resolver::ServiceResolver;
use crate::response::ResponseBody;
use crate::tls;
use bytes::Bytes;
use http::Response;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::Buffer;
use tower::limit::ConcurrencyLimitLayer;
use tower::load_shed::LoadShedLayer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

type InnerService =
    BoxCloneService<http::Request<RequestBody>, http::Response<ResponseBody>, HttpError>;

/// Builder for a [`Client`].
///
/// Starts from [`ClientConfig::default`]; every setter edits one field of it.
pub struct ClientBuilder {
    config: ClientConfig,
    resolver: Arc<dyn ServiceResolver>,
    default_options: Vec<RequestOpt>,
}

impl ClientBuilder {
    /// Builder resolving hosts with `resolver`
    #[must_use]
    pub fn new(resolver: impl ServiceResolver + 'static) -> Self {
        Self::with_config(resolver, ClientConfig::default())
    }

    /// Builder starting from `config`, e.g. [`ClientConfig::ingest`]
    #[must_use]
    pub fn with_config(resolver: impl ServiceResolver + 'static, config: ClientConfig) -> Self {
        Self {
            config,
            resolver: Arc::new(resolver),
            default_options: Vec::new(),
        }
    }

    /// Replace the resolver with one shared with other clients
    #[must_use]
    pub fn shared_resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Time allowed from sending a request until its response headers arrive
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// `User-Agent` for requests that do not set their own
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Largest response body the `HttpResponse` readers accept
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: TransportSecurity) -> Self {
        self.config.transport = transport;
        self
    }

    /// Allow plain `http://` hosts
    ///
    /// Equivalent to `.transport(TransportSecurity::AllowInsecureHttp)`.
    ///
    /// Only available in debug builds or with the `allow-insecure-http` feature.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!(
            target: "opencast_client::security",
            "allow_insecure_http() called - HTTP traffic will NOT be encrypted"
        );
        self.config.transport = TransportSecurity::AllowInsecureHttp;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Limit concurrent requests; excess requests fail with `HttpError::Overloaded`.
    /// `None` disables the limit.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: Option<RateLimitConfig>) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    /// Queue length between client clones and the shared worker, at least 1
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// `None` keeps hyper-util's default idle timeout
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_idle_per_host = max;
        self
    }

    /// Option applied to every request after the request's own options,
    /// e.g. credentials via [`with_basic_auth`](crate::request::with_basic_auth)
    #[must_use]
    pub fn default_option(mut self, option: RequestOpt) -> Self {
        self.default_options.push(option);
        self
    }

    /// Replace all default request options
    #[must_use]
    pub fn default_options(mut self, options: impl IntoIterator<Item = RequestOpt>) -> Self {
        self.default_options = options.into_iter().collect();
        self
    }

    /// Assemble the tower stack and the connection pool.
    ///
    /// Must be called inside a tokio runtime; the request buffer spawns its worker.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::Tls` if the root store cannot be loaded and
    /// `HttpError::InvalidHeaderValue` for an unusable user agent.
    pub fn build(self) -> Result<Client, HttpError> {
        if self.config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!("insecure HTTP enabled (TransportSecurity::AllowInsecureHttp)");
        }

        let timeout = self.config.request_timeout;
        let https = tls::https_connector(self.config.tls_roots, self.config.transport)?;

        let mut client_builder = HyperClient::builder(TokioExecutor::new());
        // pool_idle_timeout only takes effect with a pool timer
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle_timeout) = self.config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle_timeout);
        }
        let hyper_client = client_builder.build::<_, RequestBody>(https);

        let ua_layer = UserAgentLayer::try_new(&self.config.user_agent)?;

        // Request flow (outer to inner):
        //   Buffer -> LoadShed/Concurrency -> ErrorMapping -> Timeout ->
        //   UserAgent -> Decompression -> hyper client
        //
        // Every HTTP status is an Ok response here; classification happens
        // in HttpResponse::classify. 3xx responses are not followed.
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(ua_layer)
            .layer(DecompressionLayer::new())
            .service(hyper_client)
            .map_response(map_decompression_response)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        let mut boxed_service: InnerService = service.boxed_clone();

        if let Some(rate_limit) = self.config.rate_limit
            && !rate_limit.is_unlimited()
        {
            boxed_service = ServiceBuilder::new()
                .layer(LoadShedLayer::new())
                .layer(ConcurrencyLimitLayer::new(
                    rate_limit.max_concurrent_requests,
                ))
                .service(boxed_service)
                .map_err(map_load_shed_error)
                .boxed_clone();
        }

        let buffered: BufferedService =
            Buffer::new(boxed_service, self.config.buffer_capacity.max(1));

        Ok(Client {
            service: buffered,
            resolver: self.resolver,
            default_options: self.default_options.into(),
            max_body_size: self.config.max_body_size,
            transport_security: self.config.transport,
        })
    }
}

/// Map tower errors to `HttpError` with the configured timeout
///
/// Typed `HttpError`s boxed by inner middleware are unwrapped rather than
/// reported as transport failures.
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

fn map_load_shed_error(err: tower::BoxError) -> HttpError {
    if err.is::<tower::load_shed::error::Overloaded>() {
        return HttpError::Overloaded;
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => HttpError::Transport(err),
    }
}

/// Box the decompression body into [`ResponseBody`].
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}
