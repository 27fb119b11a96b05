use super::ServiceResolver;
use super::registry::{RegistryLookup, ServiceRegistry};
use crate::error::{HttpError, SharedError};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default lifetime of a registry answer.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// What to do when refreshing an expired entry fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StaleHostsPolicy {
    /// Return the registry error.
    #[default]
    Fail,
    /// Keep answering from the expired host list and retry the refresh on the
    /// next call. Authoritative answers (unknown service, no hosts) still fail.
    ServeStale,
}

#[derive(Debug)]
struct CachedHosts {
    hosts: Vec<String>,
    expires_at: Instant,
}

impl CachedHosts {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Failed refresh, kept in a form every waiting caller can get a copy of.
#[derive(Debug, Clone)]
enum RefreshFailure {
    NotFound,
    NoHosts,
    Registry(SharedError<HttpError>),
}

impl RefreshFailure {
    fn into_error(self, service: &str) -> HttpError {
        let service = service.to_owned();
        match self {
            Self::NotFound => HttpError::ServiceNotFound { service },
            Self::NoHosts => HttpError::NoAvailableHosts { service },
            Self::Registry(source) => HttpError::Registry { service, source },
        }
    }
}

type RefreshOutcome = Result<Arc<CachedHosts>, RefreshFailure>;

/// Per-service cache cell. Reads go through `cached` without locking;
/// `refresh` serialises registry queries for this service only and keeps the
/// outcome of the last one. `attempts` counts finished queries.
#[derive(Debug, Default)]
struct ServiceSlot {
    cached: ArcSwapOption<CachedHosts>,
    refresh: Mutex<Option<RefreshOutcome>>,
    attempts: AtomicU64,
}

/// Resolver backed by the Opencast service registry.
///
/// Registry answers are cached per service for a TTL. Concurrent lookups of an
/// expired or missing service share a single registry query; lookups of other
/// services are not blocked by it. Each call picks a host uniformly at random.
pub struct DynamicServiceResolver<R> {
    registry: R,
    ttl: Duration,
    stale_policy: StaleHostsPolicy,
    slots: DashMap<String, Arc<ServiceSlot>>,
}

impl<R: ServiceRegistry> DynamicServiceResolver<R> {
    #[must_use]
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            ttl: DEFAULT_TTL,
            stale_policy: StaleHostsPolicy::default(),
            slots: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_stale_policy(mut self, policy: StaleHostsPolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Forget the cached hosts of `service`; the next lookup asks the registry.
    pub fn invalidate(&self, service: &str) {
        self.slots.remove(service);
    }

    /// Cached hosts of `service`, fresh or not.
    #[must_use]
    pub fn cached_hosts(&self, service: &str) -> Option<Vec<String>> {
        let slot = self.slots.get(service)?;
        slot.cached.load_full().map(|c| c.hosts.clone())
    }

    fn slot(&self, service: &str) -> Arc<ServiceSlot> {
        if let Some(slot) = self.slots.get(service) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(service.to_owned()).or_default().value())
    }

    async fn hosts(&self, service: &str) -> Result<Arc<CachedHosts>, HttpError> {
        let slot = self.slot(service);
        if let Some(cached) = slot.cached.load_full()
            && cached.is_fresh()
        {
            return Ok(cached);
        }

        let seen = slot.attempts.load(Ordering::Acquire);
        let mut last = slot.refresh.lock().await;

        // A query finished while we waited for the lock: its outcome, success
        // or failure, is ours too.
        if slot.attempts.load(Ordering::Acquire) != seen
            && let Some(outcome) = last.as_ref()
        {
            return outcome.clone().map_err(|failure| failure.into_error(service));
        }

        let outcome = self.refresh(service, &slot).await;
        *last = Some(outcome.clone());
        slot.attempts.fetch_add(1, Ordering::Release);
        drop(last);

        if matches!(outcome, Err(RefreshFailure::NotFound)) {
            self.slots
                .remove_if(service, |_, current| Arc::ptr_eq(current, &slot));
        }
        outcome.map_err(|failure| failure.into_error(service))
    }

    async fn refresh(&self, service: &str, slot: &ServiceSlot) -> RefreshOutcome {
        let previous = slot.cached.load_full();
        match self.query(service).await {
            Ok(hosts) => {
                let fresh = Arc::new(CachedHosts {
                    hosts,
                    expires_at: Instant::now() + self.ttl,
                });
                slot.cached.store(Some(Arc::clone(&fresh)));
                Ok(fresh)
            }
            Err(RefreshFailure::Registry(err)) => match (self.stale_policy, previous) {
                (StaleHostsPolicy::ServeStale, Some(stale)) => {
                    tracing::warn!(
                        service,
                        error = %err,
                        hosts = stale.hosts.len(),
                        "service registry refresh failed; serving expired hosts"
                    );
                    Ok(stale)
                }
                _ => Err(RefreshFailure::Registry(err)),
            },
            Err(failure) => {
                slot.cached.store(None);
                Err(failure)
            }
        }
    }

    async fn query(&self, service: &str) -> Result<Vec<String>, RefreshFailure> {
        tracing::debug!(service, "querying service registry");
        match self.registry.available_hosts(service).await {
            Ok(RegistryLookup::Unknown) => Err(RefreshFailure::NotFound),
            Ok(RegistryLookup::Hosts(hosts)) if hosts.is_empty() => Err(RefreshFailure::NoHosts),
            Ok(RegistryLookup::Hosts(hosts)) => Ok(hosts),
            Err(source) => Err(RefreshFailure::Registry(Arc::new(source).into())),
        }
    }
}

#[async_trait]
impl<R: ServiceRegistry> ServiceResolver for DynamicServiceResolver<R> {
    async fn resolve(&self, service: &str) -> Result<String, HttpError> {
        let entry = self.hosts(service).await?;
        let host = entry.hosts.choose(&mut rand::rng()).cloned();
        host.ok_or_else(|| HttpError::NoAvailableHosts {
            service: service.to_owned(),
        })
    }
}
