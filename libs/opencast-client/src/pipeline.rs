//! Checked and decoded execution on top of [`Execute`].
//!
//! Requests are passed as builder closures so construction errors short-circuit
//! before anything is sent, and paginated calls can build one request per page.

use crate::client::Execute;
use crate::error::HttpError;
use crate::request::Request;
use crate::response::{HttpResponse, ResponseMeta};
use serde::de::DeserializeOwned;

/// Build, execute and classify one request.
///
/// # Errors
///
/// Returns the builder's error, the executor's error, or the classification
/// error of a non-2xx response (which still carries the response).
pub async fn execute_checked<E, F>(executor: &E, build: F) -> Result<HttpResponse, HttpError>
where
    E: Execute + ?Sized,
    F: FnOnce() -> Result<Request, HttpError>,
{
    let request = build()?;
    executor.execute(request).await?.classify()
}

/// [`execute_checked`], then decode the body as JSON or XML by its media type.
///
/// # Errors
///
/// See [`execute_checked`]. Failures of [`HttpResponse::decode_auto`] are
/// wrapped in `HttpError::Decode`, which keeps the response metadata.
pub async fn execute_decoded<T, E, F>(
    executor: &E,
    build: F,
) -> Result<(T, ResponseMeta), HttpError>
where
    T: DeserializeOwned,
    E: Execute + ?Sized,
    F: FnOnce() -> Result<Request, HttpError>,
{
    let response = execute_checked(executor, build).await?;
    let meta = response.meta();
    match response.decode_auto().await {
        Ok(value) => Ok((value, meta)),
        Err(source) => Err(HttpError::Decode {
            meta: Box::new(meta),
            source: Box::new(source),
        }),
    }
}

/// Fetch pages `0, 1, 2, ...` until `on_page` returns `false`.
///
/// `build_page` receives the page index and usually maps it to
/// [`with_pagination`](crate::params::with_pagination).
///
/// # Errors
///
/// Stops at and returns the first error of any page.
pub async fn paginate<T, E, B, C>(
    executor: &E,
    mut build_page: B,
    mut on_page: C,
) -> Result<(), HttpError>
where
    T: DeserializeOwned,
    E: Execute + ?Sized,
    B: FnMut(usize) -> Result<Request, HttpError>,
    C: FnMut(Vec<T>, &ResponseMeta) -> bool,
{
    let mut index = 0;
    loop {
        let (page, meta) = execute_decoded::<Vec<T>, _, _>(executor, || build_page(index)).await?;
        tracing::trace!(index, items = page.len(), "fetched page");
        if !on_page(page, &meta) {
            return Ok(());
        }
        index += 1;
    }
}

/// Page consumer for [`paginate`] that appends every page to `out` and stops
/// at the first empty one.
pub fn collect_all_pages<T>(out: &mut Vec<T>) -> impl FnMut(Vec<T>, &ResponseMeta) -> bool + '_ {
    move |page, _meta| {
        if page.is_empty() {
            return false;
        }
        out.extend(page);
        true
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::params::with_pagination;
    use crate::response::ResponseBody;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Method, Response, StatusCode};
    use http_body_util::{BodyExt, Full};
    use std::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves `pages[offset / limit]` as JSON, or an empty list past the end.
    struct PagedExecutor {
        pages: Vec<Vec<u32>>,
        calls: AtomicUsize,
    }

    impl PagedExecutor {
        fn new(pages: Vec<Vec<u32>>) -> Self {
            Self {
                pages,
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn respond(status: u16, content_type: &str, body: String) -> HttpResponse {
        let body: ResponseBody = Full::new(Bytes::from(body))
            .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
            .boxed();
        let inner = Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, content_type)
            .body(body)
            .unwrap();
        HttpResponse::new(inner, 1024, Duration::from_millis(1))
    }

    #[async_trait]
    impl Execute for PagedExecutor {
        async fn execute(&self, request: Request) -> Result<HttpResponse, HttpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let number = |key| {
                request
                    .query_value(key)
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0)
            };
            let page = number("offset") / number("limit").max(1);
            let items = self.pages.get(page).cloned().unwrap_or_default();
            Ok(respond(
                200,
                "application/v1.11.0+json",
                serde_json::to_string(&items).unwrap(),
            ))
        }
    }

    struct FixedExecutor(u16, &'static str, &'static str);

    #[async_trait]
    impl Execute for FixedExecutor {
        async fn execute(&self, _request: Request) -> Result<HttpResponse, HttpError> {
            Ok(respond(self.0, self.1, self.2.to_owned()))
        }
    }

    fn page_request(index: usize) -> Result<Request, HttpError> {
        Request::new(
            Method::GET,
            "org.opencastproject.external",
            "/api/events",
            Body::empty(),
            &[with_pagination(2, index * 2)],
        )
    }

    #[tokio::test]
    async fn test_collect_all_pages() {
        let executor = PagedExecutor::new(vec![vec![1, 2], vec![3, 4], vec![5]]);
        let mut all: Vec<u32> = Vec::new();

        paginate(&executor, page_request, collect_all_pages(&mut all))
            .await
            .unwrap();

        assert_eq!(all, vec![1, 2, 3, 4, 5]);
        // three pages with data plus the empty one that stops collection
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_consumer_stops_early() {
        let executor = PagedExecutor::new(vec![vec![1, 2], vec![3, 4]]);
        let mut seen = 0;

        paginate(&executor, page_request, |page: Vec<u32>, meta: &ResponseMeta| {
            assert_eq!(meta.status, StatusCode::OK);
            seen += page.len();
            false
        })
        .await
        .unwrap();

        assert_eq!(seen, 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_builder_error_short_circuits() {
        let executor = PagedExecutor::new(vec![vec![1]]);
        let err = execute_checked(&executor, || {
            Request::new(
                Method::GET,
                "svc",
                "/",
                Body::empty(),
                &[crate::request::with_header("bad header", "x")],
            )
        })
        .await
        .unwrap_err();

        assert!(matches!(err, HttpError::InvalidHeaderName(_)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_page_error_stops_pagination() {
        let executor = FixedExecutor(503, "text/plain", "maintenance");
        let mut all: Vec<u32> = Vec::new();
        let err = paginate(&executor, page_request, collect_all_pages(&mut all))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Service Unavailable");
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_decoded_returns_meta() {
        let executor = FixedExecutor(201, "application/json", r#"{"identifier":"e1"}"#);
        let (value, meta): (serde_json::Value, _) =
            execute_decoded(&executor, || page_request(0)).await.unwrap();
        assert_eq!(value["identifier"], "e1");
        assert_eq!(meta.status, StatusCode::CREATED);
        assert_eq!(meta.duration, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_decoded_rejects_unsupported_media_type() {
        let executor = FixedExecutor(200, "text/plain", "hello");
        let err = execute_decoded::<serde_json::Value, _, _>(&executor, || page_request(0))
            .await
            .unwrap_err();

        let meta = err.meta().unwrap();
        assert_eq!(meta.status, StatusCode::OK);
        assert_eq!(meta.headers[http::header::CONTENT_TYPE], "text/plain");
        match err {
            HttpError::Decode { source, .. } => {
                assert!(matches!(
                    *source,
                    HttpError::UnsupportedMediaType(ref t) if t == "text/plain"
                ));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_meta() {
        let executor = FixedExecutor(200, "application/json", "{not json");
        let err = execute_decoded::<serde_json::Value, _, _>(&executor, || page_request(0))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Failed to decode response: JSON parsing failed"));
        assert_eq!(err.meta().unwrap().duration, Duration::from_millis(1));
        assert!(
            err.source()
                .unwrap()
                .to_string()
                .starts_with("JSON parsing failed")
        );
    }
}
