#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Request-execution substrate for the Opencast HTTP API
//!
//! - [`Body`] - request content: bytes, text, lazily encoded values, forms and
//!   streaming multipart messages
//! - [`Request`] - method, logical service, path, query, headers and body,
//!   composed from [`RequestOpt`]s
//! - [`resolver`] - logical service to host mapping, static or backed by the
//!   Opencast service registry with a TTL cache
//! - [`Client`] - executes requests over a hyper/rustls stack with timeouts,
//!   `User-Agent` injection and transparent response decompression
//! - [`pipeline`] - status classification, JSON/XML auto-decoding and pagination
//!
//! # Example
//!
//! ```ignore
//! use opencast_client::{Body, Client, Request, StaticServiceResolver, VersionedClient};
//! use opencast_client::params::with_pagination;
//! use opencast_client::pipeline::{collect_all_pages, paginate};
//! use opencast_client::request::with_basic_auth;
//!
//! let client = Client::builder(StaticServiceResolver::single("https://develop.opencast.org"))
//!     .default_option(with_basic_auth("admin", "opencast"))
//!     .build()?;
//! let api = VersionedClient::new(client, "v1.11.0");
//!
//! let mut events: Vec<serde_json::Value> = Vec::new();
//! paginate(
//!     &api,
//!     |page| {
//!         Request::new(
//!             http::Method::GET,
//!             "org.opencastproject.external",
//!             "/api/events",
//!             Body::empty(),
//!             &[with_pagination(100, page * 100)],
//!         )
//!     },
//!     collect_all_pages(&mut events),
//! )
//! .await?;
//! ```

mod body;
mod builder;
mod client;
mod config;
mod error;
mod layers;
pub mod multipart;
pub mod params;
pub mod pipeline;
pub mod request;
pub mod resolver;
mod response;
mod tls;

pub use body::{
    Body, BodyStream, EncodedBody, FORM_CONTENT_TYPE, FormBody, JSON_CONTENT_TYPE, RequestBody,
};
pub use builder::ClientBuilder;
pub use client::{Client, Execute, VersionedClient};
pub use config::{
    ClientConfig, DEFAULT_USER_AGENT, RateLimitConfig, TlsRootConfig, TransportSecurity,
};
pub use error::{EncodeError, HttpError, InvalidUriKind, SharedError};
pub use layers::{UserAgentLayer, UserAgentService};
pub use multipart::{Multipart, MultipartStream, Part, PartSource};
pub use request::{Request, RequestOpt};
pub use resolver::{
    DynamicServiceResolver, HttpServiceRegistry, ServiceResolver, StaleHostsPolicy,
    StaticServiceResolver,
};
pub use response::{HttpResponse, LimitedBody, MediaFamily, ResponseBody, ResponseMeta};
