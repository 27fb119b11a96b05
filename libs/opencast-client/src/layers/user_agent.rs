use crate::config::DEFAULT_USER_AGENT;
use crate::error::HttpError;
use http::header::USER_AGENT;
use http::{HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer stamping a `User-Agent` on outgoing requests
#[derive(Clone, Debug)]
pub struct UserAgentLayer {
    user_agent: HeaderValue,
}

impl UserAgentLayer {
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` if `user_agent` is not a valid header value
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, HttpError> {
        let user_agent = HeaderValue::from_str(user_agent.as_ref())?;
        Ok(Self { user_agent })
    }

    #[must_use]
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }
}

impl Default for UserAgentLayer {
    fn default() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
        }
    }
}

impl<S> Layer<S> for UserAgentLayer {
    type Service = UserAgentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UserAgentService {
            inner,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UserAgentService<S> {
    inner: S,
    user_agent: HeaderValue,
}

impl<S, B> Service<Request<B>> for UserAgentService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.headers_mut()
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::RequestBody;
    use tower::ServiceExt;

    /// Echoes the `User-Agent` the inner service saw.
    async fn seen_user_agent(layer: &UserAgentLayer, req: Request<RequestBody>) -> Option<String> {
        let echo = tower::service_fn(|req: Request<RequestBody>| async move {
            Ok::<_, HttpError>(
                req.headers()
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(ToOwned::to_owned),
            )
        });
        layer.layer(echo).oneshot(req).await.unwrap()
    }

    fn request() -> http::request::Builder {
        Request::builder().uri("https://opencast.example.org/api")
    }

    #[tokio::test]
    async fn test_default_user_agent_added() {
        let req = request().body(RequestBody::empty()).unwrap();
        let ua = seen_user_agent(&UserAgentLayer::default(), req).await;
        assert_eq!(ua.as_deref(), Some(DEFAULT_USER_AGENT));
        assert!(DEFAULT_USER_AGENT.starts_with("OpencastRustClient/"));
    }

    #[tokio::test]
    async fn test_configured_user_agent_added() {
        let layer = UserAgentLayer::try_new("lecture-sync/2.1").unwrap();
        let req = request().body(RequestBody::empty()).unwrap();
        assert_eq!(
            seen_user_agent(&layer, req).await.as_deref(),
            Some("lecture-sync/2.1")
        );
    }

    #[tokio::test]
    async fn test_request_user_agent_kept() {
        let req = request()
            .header(USER_AGENT, "custom-agent/2.0")
            .body(RequestBody::empty())
            .unwrap();
        let ua = seen_user_agent(&UserAgentLayer::default(), req).await;
        assert_eq!(ua.as_deref(), Some("custom-agent/2.0"));
    }

    #[test]
    fn test_invalid_user_agent() {
        let result = UserAgentLayer::try_new("invalid\x00agent");
        assert!(matches!(result, Err(HttpError::InvalidHeaderValue(_))));
    }
}
