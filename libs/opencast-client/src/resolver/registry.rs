use crate::body::Body;
use crate::client::Execute;
use crate::error::HttpError;
use crate::pipeline;
use crate::request::{Request, with_query};
use async_trait::async_trait;
use http::Method;
use serde::Deserialize;

/// Logical service of the Opencast service registry itself.
pub const SERVICE_REGISTRY: &str = "org.opencastproject.serviceregistry";

const AVAILABLE_SERVICES_PATH: &str = "/services/available.json";

/// Answer of a registry lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryLookup {
    /// The registry does not know the service type.
    Unknown,
    /// Base URLs of the hosts currently offering the service. May be empty.
    Hosts(Vec<String>),
}

/// Source of service-to-host mappings for [`DynamicServiceResolver`].
///
/// [`DynamicServiceResolver`]: super::DynamicServiceResolver
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// # Errors
    ///
    /// Returns the error of the underlying lookup (transport, status, decoding).
    async fn available_hosts(&self, service_type: &str) -> Result<RegistryLookup, HttpError>;
}

/// Registry queried over HTTP at `GET /services/available.json?serviceType=<type>`.
///
/// The executor must be able to reach [`SERVICE_REGISTRY`], usually through a
/// [`StaticServiceResolver`](super::StaticServiceResolver).
#[derive(Debug, Clone)]
pub struct HttpServiceRegistry<E> {
    executor: E,
}

impl<E: Execute> HttpServiceRegistry<E> {
    #[must_use]
    pub fn new(executor: E) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: Execute> ServiceRegistry for HttpServiceRegistry<E> {
    async fn available_hosts(&self, service_type: &str) -> Result<RegistryLookup, HttpError> {
        let (available, meta) = pipeline::execute_decoded::<AvailableServices, _, _>(
            &self.executor,
            || {
                Request::new(
                    Method::GET,
                    SERVICE_REGISTRY,
                    AVAILABLE_SERVICES_PATH,
                    Body::empty(),
                    &[with_query("serviceType", service_type)],
                )
            },
        )
        .await?;

        let lookup = available.into_lookup();
        let hosts = match &lookup {
            RegistryLookup::Hosts(hosts) => hosts.len(),
            RegistryLookup::Unknown => 0,
        };
        tracing::debug!(service_type, hosts, duration = ?meta.duration, "service registry answered");
        Ok(lookup)
    }
}

/// Body of `/services/available.json`.
///
/// The registry collapses its XML-shaped model into JSON, so `services` is a
/// bare string when the type is unknown, and `service` is an object for a single
/// host or an array for several.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailableServices {
    services: StringOrObject<ServiceList>,
}

impl AvailableServices {
    #[must_use]
    pub fn into_lookup(self) -> RegistryLookup {
        let list = match self.services {
            StringOrObject::String(message) => {
                tracing::trace!(%message, "service type unknown to the registry");
                return RegistryLookup::Unknown;
            }
            StringOrObject::Object(list) => list,
        };
        let records = match list.service {
            None => Vec::new(),
            Some(ObjectOrList::Object(record)) => vec![record],
            Some(ObjectOrList::List(records)) => records,
        };
        RegistryLookup::Hosts(
            records
                .into_iter()
                .map(|r| r.host)
                .filter(|host| !host.is_empty())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrObject<T> {
    String(String),
    Object(T),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ObjectOrList<T> {
    List(Vec<T>),
    Object(T),
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceList {
    #[serde(default)]
    service: Option<ObjectOrList<ServiceRecord>>,
}

/// One service registration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceRecord {
    #[serde(rename = "type")]
    pub service_type: String,
    pub host: String,
    pub path: String,
    pub active: bool,
    pub online: bool,
    pub maintenance: bool,
    #[serde(rename = "jobproducer")]
    pub job_producer: bool,
    pub service_state: Option<String>,
}
