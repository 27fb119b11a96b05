use crate::body::Body;
use crate::error::{HttpError, InvalidUriKind};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{ACCEPT, AUTHORIZATION, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Header naming the user a request is executed as.
pub const RUN_AS_USER_HEADER: &str = "X-RUN-AS-USER";

/// Header listing the roles a request is executed with.
pub const RUN_WITH_ROLES_HEADER: &str = "X-RUN-WITH-ROLES";

/// Query parameter carrying a JWT.
pub const JWT_QUERY_PARAM: &str = "jwt";

/// A call addressed to a logical service.
///
/// The request never holds a resolved host: the executor resolves
/// [`service`](Self::service) on every execution, so the same request
/// description can be replayed against a changed topology.
///
/// # Example
///
/// ```ignore
/// use opencast_client::{Body, Request, request};
///
/// let req = Request::new(
///     http::Method::GET,
///     "org.opencastproject.external.events",
///     "/api/events",
///     Body::empty(),
///     &[request::with_query("withpublications", "true")],
/// )?;
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    service: String,
    path: String,
    query: BTreeMap<String, Vec<String>>,
    headers: HeaderMap,
    body: Body,
    cancellation: Option<CancellationToken>,
}

impl Request {
    /// Build a request and apply `opts` in order.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an option.
    pub fn new(
        method: Method,
        service: impl Into<String>,
        path: impl Into<String>,
        body: Body,
        opts: &[RequestOpt],
    ) -> Result<Self, HttpError> {
        let mut req = Self {
            method,
            service: service.into(),
            path: path.into(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            body,
            cancellation: None,
        };
        req.apply(opts)?;
        Ok(req)
    }

    /// Apply further options in order; later options override earlier ones.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an option. Options before it stay applied.
    pub fn apply(&mut self, opts: &[RequestOpt]) -> Result<(), HttpError> {
        for opt in opts {
            opt.apply(self)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Logical service identifier.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Service-relative path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query(&self) -> &BTreeMap<String, Vec<String>> {
        &self.query
    }

    /// First value of a query parameter.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Replace all values of a query parameter.
    pub fn set_query(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.insert(key.into(), vec![value.into()]);
    }

    /// Append a value to a query parameter.
    pub fn add_query(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.entry(key.into()).or_default().push(value.into());
    }

    pub fn remove_query(&mut self, key: &str) {
        self.query.remove(key);
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    #[must_use]
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = Some(token);
    }

    /// Query string with keys sorted, empty when there are no parameters.
    #[must_use]
    pub fn encoded_query(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.query {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }

    /// Concrete URL of this request against a resolved base URL.
    ///
    /// The base path and the request path are joined and cleaned: repeated
    /// separators collapse, `.` and `..` segments are resolved, and the result
    /// has no trailing slash. Any query on `base` is replaced.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidUri` if `base` is not an absolute URL.
    pub fn url(&self, base: &str) -> Result<Url, HttpError> {
        let mut url = Url::parse(base).map_err(|e| HttpError::InvalidUri {
            url: base.to_owned(),
            kind: match e {
                url::ParseError::RelativeUrlWithoutBase => InvalidUriKind::MissingScheme,
                url::ParseError::EmptyHost => InvalidUriKind::MissingAuthority,
                _ => InvalidUriKind::ParseError,
            },
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() || !url.has_host() {
            return Err(HttpError::InvalidUri {
                url: base.to_owned(),
                kind: InvalidUriKind::MissingAuthority,
                reason: "missing host/authority".to_owned(),
            });
        }

        let path = join_path(url.path(), &self.path);
        url.set_path(&path);

        let query = self.encoded_query();
        url.set_query((!query.is_empty()).then_some(query.as_str()));
        url.set_fragment(None);
        Ok(url)
    }

    pub(crate) fn into_parts(self) -> (Method, HeaderMap, Body, Option<CancellationToken>) {
        (self.method, self.headers, self.body, self.cancellation)
    }
}

/// Join URL paths the way a cleaned `a/b` path join does: always rooted,
/// empty and `.` segments dropped, `..` popping the previous segment.
#[must_use]
pub fn join_path(base: &str, path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

type OptFn = dyn Fn(&mut Request) -> Result<(), HttpError> + Send + Sync;

/// A composable request mutation.
///
/// Options are cheap to clone and can be shared, e.g. as client defaults.
#[derive(Clone)]
pub struct RequestOpt(Arc<OptFn>);

impl RequestOpt {
    #[must_use]
    pub fn new(f: impl Fn(&mut Request) -> Result<(), HttpError> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Apply this option to `req`.
    ///
    /// # Errors
    ///
    /// Returns whatever error the option raises.
    pub fn apply(&self, req: &mut Request) -> Result<(), HttpError> {
        (self.0)(req)
    }
}

impl fmt::Debug for RequestOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestOpt(..)")
    }
}

/// Set a query parameter, replacing earlier values.
#[must_use]
pub fn with_query(key: impl Into<String>, value: impl Into<String>) -> RequestOpt {
    let key = key.into();
    let value = value.into();
    RequestOpt::new(move |req| {
        req.set_query(key.clone(), value.clone());
        Ok(())
    })
}

/// Remove a query parameter.
#[must_use]
pub fn without_query(key: impl Into<String>) -> RequestOpt {
    let key = key.into();
    RequestOpt::new(move |req| {
        req.remove_query(&key);
        Ok(())
    })
}

/// Set a header, replacing earlier values.
///
/// An invalid name or value fails when the option is applied.
#[must_use]
pub fn with_header(name: impl Into<String>, value: impl Into<String>) -> RequestOpt {
    let name = name.into();
    let value = value.into();
    RequestOpt::new(move |req| {
        let name = HeaderName::try_from(name.as_str())?;
        let value = HeaderValue::try_from(value.as_str())?;
        req.headers_mut().insert(name, value);
        Ok(())
    })
}

/// Remove a header.
#[must_use]
pub fn without_header(name: impl Into<String>) -> RequestOpt {
    let name = name.into();
    RequestOpt::new(move |req| {
        let name = HeaderName::try_from(name.as_str())?;
        req.headers_mut().remove(name);
        Ok(())
    })
}

/// `Authorization: Basic base64(username:password)`
#[must_use]
pub fn with_basic_auth(username: &str, password: &str) -> RequestOpt {
    let credentials = STANDARD.encode(format!("{username}:{password}"));
    with_header(AUTHORIZATION.as_str(), format!("Basic {credentials}"))
}

/// JWT in a header, the value being `prefix` followed by `token`.
#[must_use]
pub fn with_jwt_header(header: &str, prefix: &str, token: &str) -> RequestOpt {
    with_header(header, format!("{prefix}{token}"))
}

/// JWT in the `jwt` query parameter.
#[must_use]
pub fn with_jwt_query(token: impl Into<String>) -> RequestOpt {
    with_query(JWT_QUERY_PARAM, token)
}

#[must_use]
pub fn with_run_as_user(username: impl Into<String>) -> RequestOpt {
    with_header(RUN_AS_USER_HEADER, username)
}

#[must_use]
pub fn with_run_with_roles<S: AsRef<str>>(roles: &[S]) -> RequestOpt {
    let roles: Vec<&str> = roles.iter().map(AsRef::as_ref).collect();
    with_header(RUN_WITH_ROLES_HEADER, roles.join(","))
}

/// Override the `Accept` header.
#[must_use]
pub fn with_accept(media_type: impl Into<String>) -> RequestOpt {
    with_header(ACCEPT.as_str(), media_type)
}

/// Cancel the request when `token` fires.
#[must_use]
pub fn with_cancellation(token: CancellationToken) -> RequestOpt {
    RequestOpt::new(move |req| {
        req.set_cancellation(token.clone());
        Ok(())
    })
}
