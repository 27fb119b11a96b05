use std::time::Duration;

/// `User-Agent` sent when the caller sets none.
pub const DEFAULT_USER_AGENT: &str = concat!("OpencastRustClient/", env!("CARGO_PKG_VERSION"));

const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Cap on requests in flight through one client and its clones.
///
/// Requests over the cap are shed with `HttpError::Overloaded` rather than
/// queued, so a stuck Opencast node cannot pile up work in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_concurrent_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_REQUESTS)
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self {
            max_concurrent_requests,
        }
    }

    /// No cap. The builder skips the limit layers entirely.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_concurrent_requests == usize::MAX
    }
}

/// Where trusted root certificates come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Bundled Mozilla roots, identical on every platform.
    #[default]
    WebPki,
    /// The operating system's trust store, for installations behind a
    /// private CA.
    Native,
}

/// Which URL schemes resolved hosts may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// `https://` only; an `http://` host fails with `HttpError::InvalidScheme`.
    #[default]
    TlsOnly,
    /// `http://` hosts are accepted as well.
    ///
    /// Opencast nodes inside a cluster are often reached over plain HTTP.
    /// Outside of that, use only against local mock servers.
    AllowInsecureHttp,
}

/// Settings of a [`Client`](crate::Client), normally edited through
/// [`ClientBuilder`](crate::ClientBuilder).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout, covering upload of the request body and arrival of
    /// the response headers (default: 120 seconds)
    pub request_timeout: Duration,

    /// Largest response body the readers of `HttpResponse` accept, counted
    /// after decompression (default: 10 MiB)
    pub max_body_size: usize,

    /// Default `User-Agent` (default: `OpencastRustClient/<version>`)
    pub user_agent: String,

    /// `None` disables the concurrency cap.
    pub rate_limit: Option<RateLimitConfig>,

    pub transport: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    /// Requests queued between client clones and the shared worker (default: 1024)
    ///
    /// A full queue fails fast with `HttpError::Overloaded`.
    pub buffer_capacity: usize,

    /// How long an idle pooled connection is kept (default: 90 seconds);
    /// `None` keeps hyper-util's own default
    pub pool_idle_timeout: Option<Duration>,

    /// Idle connections kept per Opencast node (default: 32); `0` disables reuse
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            max_body_size: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            rate_limit: Some(RateLimitConfig::default()),
            transport: TransportSecurity::default(),
            tls_roots: TlsRootConfig::default(),
            buffer_capacity: 1024,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl ClientConfig {
    /// Configuration for media ingest.
    ///
    /// Multipart uploads of recordings stream for a long time before the
    /// server answers, so the timeout is one hour and concurrency is kept low.
    #[must_use]
    pub fn ingest() -> Self {
        Self {
            request_timeout: Duration::from_secs(3600),
            rate_limit: Some(RateLimitConfig::new(10)),
            buffer_capacity: 64,
            pool_max_idle_per_host: 4,
            ..Self::default()
        }
    }

    /// Short timeouts, no concurrency cap and plain HTTP allowed, for tests
    /// against local mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            rate_limit: None,
            transport: TransportSecurity::AllowInsecureHttp,
            buffer_capacity: 256,
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert!(config.user_agent.starts_with("OpencastRustClient/"));
        assert_eq!(config.transport, TransportSecurity::TlsOnly);
        assert_eq!(config.tls_roots, TlsRootConfig::WebPki);
        assert_eq!(config.rate_limit, Some(RateLimitConfig::new(100)));
    }

    #[test]
    fn test_ingest_config() {
        let config = ClientConfig::ingest();
        assert_eq!(config.request_timeout, Duration::from_secs(3600));
        assert_eq!(config.rate_limit, Some(RateLimitConfig::new(10)));
        assert_eq!(config.transport, TransportSecurity::TlsOnly);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_for_testing_config() {
        let config = ClientConfig::for_testing();
        assert_eq!(config.transport, TransportSecurity::AllowInsecureHttp);
        assert!(config.rate_limit.is_none());
        assert_eq!(config.tls_roots, TlsRootConfig::WebPki);
    }

    #[test]
    fn test_unlimited_rate_limit() {
        assert!(RateLimitConfig::unlimited().is_unlimited());
        assert!(!RateLimitConfig::default().is_unlimited());
    }
}
