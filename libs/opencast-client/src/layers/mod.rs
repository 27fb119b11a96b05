//! Tower layers of the client stack.
//!
//! - [`UserAgentLayer`] - sets `User-Agent` unless the request carries one

mod user_agent;

pub use user_agent::{UserAgentLayer, UserAgentService};
