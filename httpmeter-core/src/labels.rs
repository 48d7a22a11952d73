//! Custom label sources
//!
//! A label value either comes from the request (known before the inner
//! service runs) or from the response headers (known once the response head
//! is produced).

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use http::{HeaderMap, Request};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ResolveFn = dyn Fn(&Request<()>) -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync;

/// Where a custom label gets its value from.
#[derive(Clone)]
pub enum LabelSource {
    Literal(String),
    Request(RequestLabel),
    Response(ResponseHeaderLabel),
}

impl LabelSource {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }
}

impl fmt::Debug for LabelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Request(_) => f.write_str("Request(..)"),
            Self::Response(label) => f.debug_tuple("Response").field(label).finish(),
        }
    }
}

impl From<&str> for LabelSource {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for LabelSource {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl From<RequestLabel> for LabelSource {
    fn from(label: RequestLabel) -> Self {
        Self::Request(label)
    }
}

impl From<ResponseHeaderLabel> for LabelSource {
    fn from(label: ResponseHeaderLabel) -> Self {
        Self::Response(label)
    }
}

/// Resolver evaluated against the request head before the inner service runs.
#[derive(Clone)]
pub struct RequestLabel {
    resolve: Arc<ResolveFn>,
}

impl RequestLabel {
    /// Synchronous resolver.
    pub fn from_fn<F, E>(f: F) -> Self
    where
        F: Fn(&Request<()>) -> Result<String, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self {
            resolve: Arc::new(move |request: &Request<()>| {
                let result: Result<String, BoxError> = f(request).map_err(Into::into);
                future::ready(result).boxed()
            }),
        }
    }

    /// Asynchronous resolver. The returned future must own whatever it needs
    /// from the request.
    pub fn from_async_fn<F, Fut, E>(f: F) -> Self
    where
        F: Fn(&Request<()>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            resolve: Arc::new(move |request: &Request<()>| {
                f(request)
                    .map(|result| -> Result<String, BoxError> { result.map_err(Into::into) })
                    .boxed()
            }),
        }
    }

    pub async fn resolve(&self, request: &Request<()>) -> Result<String, BoxError> {
        (self.resolve)(request).await
    }
}

/// Label populated from a response header once the response head is known.
#[derive(Debug, Clone)]
pub struct ResponseHeaderLabel {
    key: String,
    default: String,
    allowed_values: Option<HashSet<String>>,
}

impl ResponseHeaderLabel {
    pub fn new<I, S>(key: &str, allowed_values: Option<I>, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.to_lowercase(),
            default: default.into(),
            allowed_values: allowed_values.map(|values| values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn default_value(&self) -> &str {
        &self.default
    }

    /// Value for this label given the response headers. Absent headers,
    /// undecodable values and values outside the allow-list yield the default.
    pub fn resolve(&self, headers: &HeaderMap) -> String {
        let Some(value) = headers.get(self.key.as_str()).and_then(|v| v.to_str().ok()) else {
            return self.default.clone();
        };
        match &self.allowed_values {
            Some(allowed) if !allowed.contains(value) => self.default.clone(),
            _ => value.to_string(),
        }
    }
}

/// Request-time label reading a request header.
///
/// Missing headers, and values outside `allowed_values` when given, produce
/// an empty string.
pub fn from_header<I, S>(key: &str, allowed_values: Option<I>) -> LabelSource
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let key = key.to_lowercase();
    let allowed: Option<HashSet<String>> =
        allowed_values.map(|values| values.into_iter().map(Into::into).collect());

    LabelSource::Request(RequestLabel::from_fn(move |request: &Request<()>| {
        let value = request
            .headers()
            .get(key.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let value = match &allowed {
            Some(allowed) if !allowed.contains(value) => "",
            _ => value,
        };
        Ok::<_, BoxError>(value.to_string())
    }))
}

/// Response-time label reading a response header.
pub fn from_response_header<I, S>(
    key: &str,
    allowed_values: Option<I>,
    default: impl Into<String>,
) -> LabelSource
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    LabelSource::Response(ResponseHeaderLabel::new(key, allowed_values, default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const NO_VALUES: Option<[&str; 0]> = None;

    fn request_with(header: &str, value: &str) -> Request<()> {
        Request::builder().header(header, value).body(()).unwrap()
    }

    async fn resolve(source: &LabelSource, request: &Request<()>) -> String {
        match source {
            LabelSource::Request(label) => label.resolve(request).await.unwrap(),
            other => panic!("unexpected label source {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_from_header() {
        let label = from_header("X-User", NO_VALUES);
        assert_eq!(resolve(&label, &request_with("x-user", "frank")).await, "frank");
        assert_eq!(resolve(&label, &Request::new(())).await, "");
    }

    #[tokio::test]
    async fn test_from_header_allowed_values() {
        let label = from_header("X-User", Some(["frank", "estelle"]));
        assert_eq!(resolve(&label, &request_with("X-User", "estelle")).await, "estelle");
        assert_eq!(resolve(&label, &request_with("X-User", "george")).await, "");
    }

    #[tokio::test]
    async fn test_async_resolver() {
        let label = RequestLabel::from_async_fn(|request: &Request<()>| {
            let method = request.method().to_string();
            async move { Ok::<_, BoxError>(method.to_lowercase()) }
        });
        assert_eq!(label.resolve(&Request::new(())).await.unwrap(), "get");
    }

    #[tokio::test]
    async fn test_failing_resolver() {
        let label = RequestLabel::from_fn(|request: &Request<()>| {
            request
                .headers()
                .get("x-missing")
                .ok_or("header missing")
                .map(|_| "present".to_string())
        });
        assert!(label.resolve(&Request::new(())).await.is_err());
    }

    #[test]
    fn test_response_header_label() {
        let label = ResponseHeaderLabel::new("X-Cache", NO_VALUES, "unknown");
        let mut headers = HeaderMap::new();
        assert_eq!(label.resolve(&headers), "unknown");

        headers.insert("x-cache", HeaderValue::from_static("HIT"));
        assert_eq!(label.resolve(&headers), "HIT");
    }

    #[test]
    fn test_response_header_label_allowed_values() {
        let label = ResponseHeaderLabel::new("x-cache", Some(["HIT", "MISS"]), "");
        let mut headers = HeaderMap::new();
        headers.insert("X-Cache", HeaderValue::from_static("STALE"));
        assert_eq!(label.resolve(&headers), "");

        headers.insert("X-Cache", HeaderValue::from_static("MISS"));
        assert_eq!(label.resolve(&headers), "MISS");
    }

    #[test]
    fn test_label_source_kinds() {
        assert!(from_response_header("x-cache", NO_VALUES, "").is_response());
        assert!(!LabelSource::from("static").is_response());
    }
}
