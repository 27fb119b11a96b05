//! Mapping of logical Opencast services to base URLs.
//!
//! Requests name a logical service (`org.opencastproject.external`, ...); a
//! [`ServiceResolver`] turns that into the base URL of a host serving it, once
//! per execution.

mod dynamic;
mod registry;

pub use dynamic::{DEFAULT_TTL, DynamicServiceResolver, StaleHostsPolicy};
pub use registry::{
    AvailableServices, HttpServiceRegistry, RegistryLookup, SERVICE_REGISTRY, ServiceRecord,
    ServiceRegistry,
};

use crate::error::HttpError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a logical service identifier to the base URL of a host.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// # Errors
    ///
    /// `HttpError::ServiceNotFound` for unknown services; implementations may
    /// add their own lookup failures.
    async fn resolve(&self, service: &str) -> Result<String, HttpError>;
}

#[async_trait]
impl<R: ServiceResolver + ?Sized> ServiceResolver for Arc<R> {
    async fn resolve(&self, service: &str) -> Result<String, HttpError> {
        (**self).resolve(service).await
    }
}

/// Fixed service table with an optional fallback host.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceResolver {
    default: Option<String>,
    hosts: HashMap<String, String>,
}

impl StaticServiceResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver answering every service with `host`.
    #[must_use]
    pub fn single(host: impl Into<String>) -> Self {
        Self::new().with_default(host)
    }

    /// Host used for services without an explicit entry.
    #[must_use]
    pub fn with_default(mut self, host: impl Into<String>) -> Self {
        self.default = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>, host: impl Into<String>) -> Self {
        self.hosts.insert(service.into(), host.into());
        self
    }

    fn lookup(&self, service: &str) -> Option<&str> {
        self.hosts
            .get(service)
            .or(self.default.as_ref())
            .map(String::as_str)
    }
}

impl<S, H> FromIterator<(S, H)> for StaticServiceResolver
where
    S: Into<String>,
    H: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (S, H)>>(iter: I) -> Self {
        Self {
            default: None,
            hosts: iter
                .into_iter()
                .map(|(service, host)| (service.into(), host.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl ServiceResolver for StaticServiceResolver {
    async fn resolve(&self, service: &str) -> Result<String, HttpError> {
        self.lookup(service)
            .map(ToOwned::to_owned)
            .ok_or_else(|| HttpError::ServiceNotFound {
                service: service.to_owned(),
            })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_explicit_entry_wins() {
        let resolver = StaticServiceResolver::new()
            .with_default("https://admin.example.org")
            .with_service("org.opencastproject.external", "https://api.example.org");

        assert_eq!(
            resolver.resolve("org.opencastproject.external").await.unwrap(),
            "https://api.example.org"
        );
        assert_eq!(
            resolver.resolve("org.opencastproject.search").await.unwrap(),
            "https://admin.example.org"
        );
    }

    #[tokio::test]
    async fn test_static_unknown_without_default() {
        let resolver: StaticServiceResolver =
            [("org.opencastproject.external", "https://api.example.org")]
                .into_iter()
                .collect();

        let err = resolver.resolve("org.opencastproject.search").await.unwrap_err();
        assert!(matches!(
            err,
            HttpError::ServiceNotFound { ref service } if service == "org.opencastproject.search"
        ));
    }

    #[tokio::test]
    async fn test_resolver_behind_arc() {
        let resolver: Arc<dyn ServiceResolver> =
            Arc::new(StaticServiceResolver::single("https://oc.example.org"));
        assert_eq!(
            resolver.resolve("anything").await.unwrap(),
            "https://oc.example.org"
        );
    }
}
