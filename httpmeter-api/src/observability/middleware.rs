//! Tower layer recording request count, duration and in-flight requests.
//!
//! Each tracked request owns a [`RequestTracker`]. The tracker increments the
//! in-progress gauge when created and records everything else exactly once,
//! when it is finished or dropped: after the response body ends, when the
//! inner service fails or panics, or when the client goes away mid-request.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use bytes::Bytes;
use futures::FutureExt;
use http::{header, HeaderMap, Request, Response, StatusCode};
use regex::Regex;
use tower::{Layer, Service};

use httpmeter_core::labels::{BoxError, LabelSource, ResponseHeaderLabel};
use httpmeter_core::registry::{
    CounterHandle, GaugeHandle, HistogramHandle, MetricHandle, MetricKind, MetricsRegistry,
};
use httpmeter_core::routing::{RequestScope, Router};
use httpmeter_core::{Error, ExporterConfig, OptionalMetric, Result};

use super::body::MetricsBody;

/// Path label used for unmatched requests when grouping them.
pub const UNKNOWN_PATH: &str = "__unknown__";

/// Status recorded when the client disconnects before a response exists.
const CLIENT_CLOSED_REQUEST: u16 = 499;

const BASE_LABELS: [&str; 4] = ["method", "path", "status_code", "app_name"];

pub type ExemplarLabels = Vec<(String, String)>;

/// Generator for exemplar labels attached to counter and histogram samples.
#[derive(Clone)]
pub enum ExemplarFn {
    Static(Arc<dyn Fn() -> ExemplarLabels + Send + Sync>),
    WithRequest(Arc<dyn Fn(&Request<()>) -> ExemplarLabels + Send + Sync>),
}

impl ExemplarFn {
    pub fn new(f: impl Fn() -> ExemplarLabels + Send + Sync + 'static) -> Self {
        Self::Static(Arc::new(f))
    }

    /// Generator that inspects the request head, e.g. to read a trace header.
    pub fn with_request(f: impl Fn(&Request<()>) -> ExemplarLabels + Send + Sync + 'static) -> Self {
        Self::WithRequest(Arc::new(f))
    }

    fn generate(&self, request: &Request<()>) -> ExemplarLabels {
        match self {
            Self::Static(f) => f(),
            Self::WithRequest(f) => f(request),
        }
    }
}

impl fmt::Debug for ExemplarFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("ExemplarFn::Static(..)"),
            Self::WithRequest(_) => f.write_str("ExemplarFn::WithRequest(..)"),
        }
    }
}

struct MetricNames {
    requests: String,
    duration: String,
    response_body: String,
    request_body: String,
}

impl MetricNames {
    fn new(prefix: &str) -> Self {
        Self {
            requests: format!("{prefix}_requests_total"),
            duration: format!("{prefix}_request_duration_seconds"),
            response_body: format!("{prefix}_response_body_bytes_total"),
            request_body: format!("{prefix}_request_body_bytes_total"),
        }
    }
}

struct HttpMetrics {
    requests: CounterHandle,
    duration: HistogramHandle,
    in_progress: GaugeHandle,
    response_body: Option<CounterHandle>,
    request_body: Option<CounterHandle>,
}

/// Configuration and metric handles shared by every request of a layer.
pub(crate) struct MetricsState {
    registry: MetricsRegistry,
    metrics: HttpMetrics,
    names: MetricNames,
    app_name: String,
    label_names: Vec<String>,
    request_labels: Vec<(String, LabelSource)>,
    response_labels: Vec<(String, ResponseHeaderLabel)>,
    exemplars: Option<ExemplarFn>,
    routes: Option<Router>,
    group_paths: bool,
    filter_unhandled_paths: bool,
    group_unhandled_paths: bool,
    skip_paths: Vec<Regex>,
    skip_methods: HashSet<String>,
    root_path: Option<String>,
    /// Set once a request needed a route template and none was available.
    missing_route_info_warned: AtomicBool,
}

impl MetricsState {
    /// Request path relative to the configured root path. The root only
    /// matches whole segments, so `/apiary` is not under `/api`.
    fn relative_path(&self, path: &str) -> String {
        let rest = self
            .root_path
            .as_deref()
            .and_then(|root| path.strip_prefix(root))
            .filter(|rest| rest.is_empty() || rest.starts_with('/'));
        match rest {
            Some("") => "/".to_string(),
            Some(rest) => rest.to_string(),
            None => path.to_string(),
        }
    }

    fn skips(&self, method: &str, path: &str) -> bool {
        self.skip_methods.contains(method) || self.skip_paths.iter().any(|re| re.is_match(path))
    }

    async fn request_label_values(&self, head: &Request<()>) -> Vec<String> {
        let mut values = Vec::with_capacity(self.request_labels.len());
        for (name, source) in &self.request_labels {
            let value = match source {
                LabelSource::Literal(value) => value.clone(),
                LabelSource::Request(label) => match label.resolve(head).await {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(label = %name, error = %e, "label function failed");
                        String::new()
                    }
                },
                LabelSource::Response(_) => String::new(),
            };
            values.push(value);
        }
        values
    }

    fn response_label_values(&self, headers: &HeaderMap) -> Vec<String> {
        self.response_labels
            .iter()
            .map(|(_, label)| label.resolve(headers))
            .collect()
    }

    /// Path label for a finished request; `None` drops the request.
    fn path_label(&self, tracker: &RequestTracker) -> Option<String> {
        if !(self.group_paths || self.filter_unhandled_paths || self.group_unhandled_paths) {
            return Some(tracker.path.clone());
        }

        let template = match &self.routes {
            Some(routes) => {
                let scope = RequestScope::new(tracker.head.method().clone(), tracker.path.clone())
                    .with_root_path(self.root_path.clone().unwrap_or_default());
                routes.resolve(&scope)
            }
            None => {
                if tracker.matched_path.is_none() {
                    self.warn_missing_route_info();
                }
                tracker.matched_path.clone()
            }
        };

        match template {
            None if self.filter_unhandled_paths => None,
            None if self.group_unhandled_paths => Some(UNKNOWN_PATH.to_string()),
            Some(template) if self.group_paths => Some(template),
            _ => Some(tracker.path.clone()),
        }
    }

    fn warn_missing_route_info(&self) {
        if !self.missing_route_info_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "no route template available: the layer has no route tree and the request carries no MatchedPath, \
                 so unhandled-path filtering and grouping cannot match it; use Router::layer or set routes on the builder"
            );
        }
    }

    fn increment(
        &self,
        counter: &CounterHandle,
        name: &str,
        values: &[&str],
        amount: f64,
        exemplar: Option<&ExemplarLabels>,
    ) {
        if let Err(e) = counter.inc_by(values, amount, exemplar.map(Vec::as_slice)) {
            tracing::warn!(metric = name, labels = ?self.label_names, error = %e, "failed to record counter");
        }
    }

    fn finalize(&self, tracker: &RequestTracker) {
        let method = tracker.head.method().as_str();

        let mut gauge_values = vec![method, self.app_name.as_str()];
        gauge_values.extend(tracker.request_label_values.iter().map(String::as_str));
        if let Err(e) = self.metrics.in_progress.dec(&gauge_values) {
            tracing::warn!(error = %e, "failed to decrement in-progress gauge");
        }

        let Some(path) = self.path_label(tracker) else {
            tracing::trace!(path = %tracker.path, "unhandled path, not recorded");
            return;
        };

        let status = tracker.status.unwrap_or(CLIENT_CLOSED_REQUEST).to_string();
        let response_values = match &tracker.response_label_values {
            Some(values) => values.clone(),
            None => self.response_label_values(&HeaderMap::new()),
        };

        let mut values = vec![method, path.as_str(), status.as_str(), self.app_name.as_str()];
        values.extend(tracker.request_label_values.iter().map(String::as_str));
        values.extend(response_values.iter().map(String::as_str));

        let exemplar = self.exemplars.as_ref().map(|f| f.generate(&tracker.head));
        let exemplar = exemplar.as_ref();

        if let Some(counter) = &self.metrics.response_body {
            let size = tracker.response_body_size() as f64;
            self.increment(counter, &self.names.response_body, &values, size, exemplar);
        }
        if let Some(counter) = &self.metrics.request_body {
            let size = tracker.request_body_size as f64;
            self.increment(counter, &self.names.request_body, &values, size, exemplar);
        }

        let end = tracker.end.unwrap_or_else(Instant::now);
        let duration = end.saturating_duration_since(tracker.start).as_secs_f64();

        self.increment(&self.metrics.requests, &self.names.requests, &values, 1.0, exemplar);
        if let Err(e) = self
            .metrics
            .duration
            .observe(&values, duration, exemplar.map(Vec::as_slice))
        {
            tracing::warn!(metric = %self.names.duration, error = %e, "failed to observe request duration");
        }
    }
}

/// Per-request state, finalized exactly once on [`Drop`].
pub(crate) struct RequestTracker {
    state: Arc<MetricsState>,
    head: Request<()>,
    path: String,
    matched_path: Option<String>,
    request_label_values: Vec<String>,
    response_label_values: Option<Vec<String>>,
    status: Option<u16>,
    start: Instant,
    end: Option<Instant>,
    request_body_size: u64,
    response_content_length: Option<u64>,
    response_bytes: u64,
}

impl RequestTracker {
    fn start(
        state: Arc<MetricsState>,
        head: Request<()>,
        path: String,
        request_label_values: Vec<String>,
        start: Instant,
    ) -> Self {
        let mut gauge_values = vec![head.method().as_str(), state.app_name.as_str()];
        gauge_values.extend(request_label_values.iter().map(String::as_str));
        if let Err(e) = state.metrics.in_progress.inc(&gauge_values) {
            tracing::warn!(error = %e, "failed to increment in-progress gauge");
        }

        let matched_path = head.extensions().get::<MatchedPath>().map(|m| m.as_str().to_string());
        let request_body_size = content_length(head.headers()).unwrap_or(0);

        Self {
            state,
            head,
            path,
            matched_path,
            request_label_values,
            response_label_values: None,
            status: None,
            start,
            end: None,
            request_body_size,
            response_content_length: None,
            response_bytes: 0,
        }
    }

    fn observe_response(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.status = Some(status.as_u16());
        self.response_label_values = Some(self.state.response_label_values(headers));
        self.response_content_length = content_length(headers);
    }

    fn fail(&mut self) {
        self.status = Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
        self.response_label_values = Some(self.state.response_label_values(&HeaderMap::new()));
    }

    pub(crate) fn on_data(&mut self, len: usize) {
        self.response_bytes += len as u64;
        self.end = Some(Instant::now());
    }

    pub(crate) fn on_end(&mut self) {
        self.end = Some(Instant::now());
    }

    /// Declared `content-length`, or the bytes actually streamed without one.
    fn response_body_size(&self) -> u64 {
        self.response_content_length.unwrap_or(self.response_bytes)
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        let state = self.state.clone();
        state.finalize(self);
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Protocol upgrades (WebSocket and friends) are not plain HTTP exchanges.
fn is_upgrade<B>(request: &Request<B>) -> bool {
    request.headers().contains_key(header::UPGRADE)
        && request
            .headers()
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
}

fn request_head<B>(request: &Request<B>) -> Request<()> {
    let mut head = Request::new(());
    *head.method_mut() = request.method().clone();
    *head.uri_mut() = request.uri().clone();
    *head.version_mut() = request.version();
    *head.headers_mut() = request.headers().clone();
    *head.extensions_mut() = request.extensions().clone();
    head
}

/// Builder for [`PrometheusLayer`].
#[derive(Default)]
pub struct PrometheusLayerBuilder {
    config: ExporterConfig,
    labels: Vec<(String, LabelSource)>,
    exemplars: Option<ExemplarFn>,
    routes: Option<Router>,
    registry: Option<MetricsRegistry>,
}

impl PrometheusLayerBuilder {
    #[must_use]
    pub fn config(mut self, config: ExporterConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a custom label. Setting a name twice keeps the last source.
    #[must_use]
    pub fn label(mut self, name: impl Into<String>, source: impl Into<LabelSource>) -> Self {
        let name = name.into();
        let source = source.into();
        match self.labels.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = source,
            None => self.labels.push((name, source)),
        }
        self
    }

    #[must_use]
    pub fn exemplars(mut self, exemplars: ExemplarFn) -> Self {
        self.exemplars = Some(exemplars);
        self
    }

    /// Route tree used to group paths. Without one, the template axum
    /// matched (`MatchedPath`) is used when available.
    #[must_use]
    pub fn routes(mut self, routes: Router) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Registry to create metrics on. Defaults to [`MetricsRegistry::global`].
    #[must_use]
    pub fn registry(mut self, registry: MetricsRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<PrometheusLayer> {
        let config = self.config;
        let registry = self
            .registry
            .unwrap_or_else(|| MetricsRegistry::global().clone());

        let mut filter_unhandled_paths = config.filter_unhandled_paths;
        if config.group_unhandled_paths && filter_unhandled_paths {
            tracing::warn!(
                "group_unhandled_paths and filter_unhandled_paths are both enabled, unhandled paths will be grouped instead of filtered"
            );
            filter_unhandled_paths = false;
        }
        if self.routes.is_none()
            && (config.group_paths || filter_unhandled_paths || config.group_unhandled_paths)
        {
            tracing::warn!(
                "path grouping or unhandled-path handling is enabled without a route tree; \
                 paths are only resolved when the layer runs inside an axum Router (Router::layer)"
            );
        }

        let mut request_labels = Vec::new();
        let mut response_labels = Vec::new();
        for (name, source) in self.labels {
            match source {
                LabelSource::Response(label) => response_labels.push((name, label)),
                other => request_labels.push((name, other)),
            }
        }

        let label_names: Vec<String> = BASE_LABELS
            .iter()
            .map(|s| (*s).to_string())
            .chain(request_labels.iter().map(|(name, _)| name.clone()))
            .chain(response_labels.iter().map(|(name, _)| name.clone()))
            .collect();
        let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let gauge_labels: Vec<&str> = ["method", "app_name"]
            .into_iter()
            .chain(request_labels.iter().map(|(name, _)| name.as_str()))
            .collect();

        let names = MetricNames::new(&config.prefix);
        let buckets = config
            .buckets
            .clone()
            .unwrap_or_else(|| prometheus::DEFAULT_BUCKETS.to_vec());

        let metrics = HttpMetrics {
            requests: counter(&registry, &names.requests, "Total HTTP requests", &label_refs)?,
            duration: histogram(
                &registry,
                &names.duration,
                "HTTP request duration, in seconds",
                buckets,
                &label_refs,
            )?,
            in_progress: gauge(
                &registry,
                &format!("{}_requests_in_progress", config.prefix),
                "Total HTTP requests currently in progress",
                &gauge_labels,
            )?,
            response_body: if config.is_enabled(OptionalMetric::ResponseBodySize) {
                Some(counter(
                    &registry,
                    &names.response_body,
                    "Total HTTP response body bytes",
                    &label_refs,
                )?)
            } else {
                None
            },
            request_body: if config.is_enabled(OptionalMetric::RequestBodySize) {
                Some(counter(
                    &registry,
                    &names.request_body,
                    "Total HTTP request body bytes",
                    &label_refs,
                )?)
            } else {
                None
            },
        };

        let skip_paths = config
            .skip_paths
            .iter()
            .map(|pattern| Regex::new(&format!("^(?:{pattern})$")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let root_path = config
            .root_path
            .as_deref()
            .map(|root| root.trim_end_matches('/'))
            .filter(|root| !root.is_empty())
            .map(str::to_string);

        Ok(PrometheusLayer {
            state: Arc::new(MetricsState {
                registry,
                metrics,
                names,
                app_name: config.app_name,
                label_names,
                request_labels,
                response_labels,
                exemplars: self.exemplars,
                routes: self.routes,
                group_paths: config.group_paths,
                filter_unhandled_paths,
                group_unhandled_paths: config.group_unhandled_paths,
                skip_paths,
                skip_methods: config.skip_methods.iter().map(|m| m.to_uppercase()).collect(),
                root_path,
                missing_route_info_warned: AtomicBool::new(false),
            }),
        })
    }
}

fn schema_mismatch(name: &str, handle: &MetricHandle, requested: &str) -> Error {
    let existing = match handle {
        MetricHandle::Counter(_) => "counter",
        MetricHandle::Gauge(_) => "gauge",
        MetricHandle::Histogram(_) => "histogram",
    };
    Error::LabelSchemaMismatch {
        name: name.to_string(),
        existing: existing.to_string(),
        requested: requested.to_string(),
    }
}

fn counter(registry: &MetricsRegistry, name: &str, help: &str, labels: &[&str]) -> Result<CounterHandle> {
    match registry.get_or_create(name, help, MetricKind::Counter, labels)? {
        MetricHandle::Counter(counter) => Ok(counter),
        other => Err(schema_mismatch(name, &other, "counter")),
    }
}

fn gauge(registry: &MetricsRegistry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeHandle> {
    match registry.get_or_create(name, help, MetricKind::Gauge, labels)? {
        MetricHandle::Gauge(gauge) => Ok(gauge),
        other => Err(schema_mismatch(name, &other, "gauge")),
    }
}

fn histogram(
    registry: &MetricsRegistry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
    labels: &[&str],
) -> Result<HistogramHandle> {
    match registry.get_or_create(name, help, MetricKind::Histogram { buckets }, labels)? {
        MetricHandle::Histogram(histogram) => Ok(histogram),
        other => Err(schema_mismatch(name, &other, "histogram")),
    }
}

/// Tower layer that records HTTP metrics for the wrapped service.
#[derive(Clone)]
pub struct PrometheusLayer {
    state: Arc<MetricsState>,
}

impl PrometheusLayer {
    pub fn builder() -> PrometheusLayerBuilder {
        PrometheusLayerBuilder::default()
    }

    /// Layer for `config` on the global registry, without custom labels.
    pub fn new(config: ExporterConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.state.registry
    }
}

impl<S> Layer<S> for PrometheusLayer {
    type Service = PrometheusService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PrometheusService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Service produced by [`PrometheusLayer`].
#[derive(Clone)]
pub struct PrometheusService<S> {
    inner: S,
    state: Arc<MetricsState>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for PrometheusService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: http_body::Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        std::mem::swap(&mut self.inner, &mut inner);

        let state = self.state.clone();
        let path = state.relative_path(request.uri().path());

        if is_upgrade(&request) || state.skips(request.method().as_str(), &path) {
            return Box::pin(async move {
                let response = inner.call(request).await?;
                Ok(response.map(Body::new))
            });
        }

        let head = request_head(&request);

        Box::pin(async move {
            let start = Instant::now();
            let label_values = state.request_label_values(&head).await;
            let mut tracker = RequestTracker::start(state, head, path, label_values, start);

            let outcome = AssertUnwindSafe(async move { inner.call(request).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(response)) => {
                    tracker.observe_response(response.status(), response.headers());
                    let (parts, body) = response.into_parts();
                    let body = MetricsBody::new(Body::new(body), tracker);
                    Ok(Response::from_parts(parts, Body::new(body)))
                }
                Ok(Err(e)) => {
                    tracker.fail();
                    drop(tracker);
                    Err(e)
                }
                Err(panic) => {
                    tracker.fail();
                    drop(tracker);
                    std::panic::resume_unwind(panic)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(config: ExporterConfig) -> PrometheusLayer {
        PrometheusLayer::builder()
            .config(config)
            .registry(MetricsRegistry::new())
            .build()
            .unwrap()
    }

    #[test]
    fn test_relative_path() {
        let layer = layer(ExporterConfig {
            root_path: Some("/api/".to_string()),
            ..ExporterConfig::default()
        });
        assert_eq!(layer.state.relative_path("/api/users"), "/users");
        assert_eq!(layer.state.relative_path("/api"), "/");
        assert_eq!(layer.state.relative_path("/other"), "/other");
    }

    #[test]
    fn test_root_path_stops_at_segment_boundary() {
        let layer = layer(ExporterConfig {
            root_path: Some("/api".to_string()),
            ..ExporterConfig::default()
        });
        assert_eq!(layer.state.relative_path("/apiary"), "/apiary");
        assert_eq!(layer.state.relative_path("/api-v2/users"), "/api-v2/users");
        assert_eq!(layer.state.relative_path("/api/"), "/");
    }

    #[test]
    fn test_skip_paths_full_match() {
        let layer = layer(ExporterConfig {
            skip_paths: vec!["/health".to_string(), "/static/.*".to_string()],
            skip_methods: vec!["options".to_string()],
            ..ExporterConfig::default()
        });
        assert!(layer.state.skips("GET", "/health"));
        assert!(!layer.state.skips("GET", "/healthz"));
        assert!(layer.state.skips("GET", "/static/app.js"));
        assert!(layer.state.skips("OPTIONS", "/200"));
    }

    #[test]
    fn test_invalid_skip_pattern() {
        let result = PrometheusLayer::builder()
            .config(ExporterConfig {
                skip_paths: vec!["(".to_string()],
                ..ExporterConfig::default()
            })
            .registry(MetricsRegistry::new())
            .build();
        assert!(matches!(result, Err(Error::InvalidSkipPattern(_))));
    }

    #[test]
    fn test_group_unhandled_disables_filter() {
        let layer = layer(ExporterConfig {
            group_unhandled_paths: true,
            filter_unhandled_paths: true,
            ..ExporterConfig::default()
        });
        assert!(!layer.state.filter_unhandled_paths);
        assert!(layer.state.group_unhandled_paths);
    }

    #[test]
    fn test_label_order() {
        let layer = PrometheusLayer::builder()
            .registry(MetricsRegistry::new())
            .label(
                "cache",
                httpmeter_core::from_response_header("x-cache", None::<Vec<String>>, ""),
            )
            .label("service", "api")
            .build()
            .unwrap();
        assert_eq!(
            layer.state.label_names,
            vec!["method", "path", "status_code", "app_name", "service", "cache"]
        );
    }

    #[test]
    fn test_missing_route_info_warns_once() {
        let layer = layer(ExporterConfig::default());
        assert!(!layer.state.missing_route_info_warned.load(Ordering::Relaxed));
        layer.state.warn_missing_route_info();
        layer.state.warn_missing_route_info();
        assert!(layer.state.missing_route_info_warned.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_outer_layer_without_routes_flags_missing_route_info() {
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        let registry = MetricsRegistry::new();
        let metrics = PrometheusLayer::builder().registry(registry.clone()).build().unwrap();
        let app = axum::Router::new().route("/200", axum::routing::get(|| async { "ok" }));

        let response = metrics
            .layer(app)
            .oneshot(Request::get("/200").body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.into_body().collect().await.unwrap();

        assert!(metrics.state.missing_route_info_warned.load(Ordering::Relaxed));
        let text = httpmeter_core::exposition::encode_text(&registry).unwrap();
        assert!(!text.contains(r#"path="/200""#));
    }

    #[test]
    fn test_is_upgrade() {
        let upgrade = Request::builder()
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade(&upgrade));
        assert!(!is_upgrade(&Request::new(())));
    }
}
