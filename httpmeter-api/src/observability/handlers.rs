//! Metrics exposition endpoints.

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use httpmeter_core::exposition::{self, OPENMETRICS_CONTENT_TYPE, TEXT_CONTENT_TYPE};
use httpmeter_core::{MetricsRegistry, MultiProcessCollector, Result};

/// Renders a registry, or the merged snapshots of every worker process in
/// multi-process mode.
#[derive(Debug, Clone)]
pub struct MetricsHandler {
    registry: MetricsRegistry,
    multiprocess: Option<Arc<MultiProcessCollector>>,
}

impl MetricsHandler {
    /// Handler for an explicitly injected registry. Multi-process mode is
    /// never enabled implicitly here.
    pub fn new(registry: MetricsRegistry) -> Self {
        Self {
            registry,
            multiprocess: None,
        }
    }

    /// Handler for the global registry, in multi-process mode when
    /// `PROMETHEUS_MULTIPROC_DIR` is set.
    pub fn from_env() -> Self {
        Self {
            registry: MetricsRegistry::global().clone(),
            multiprocess: MultiProcessCollector::from_env().map(Arc::new),
        }
    }

    #[must_use]
    pub fn with_multiprocess(mut self, collector: Arc<MultiProcessCollector>) -> Self {
        self.multiprocess = Some(collector);
        self
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Prometheus text format.
    pub async fn handle_metrics(&self) -> Response {
        let encoded = match &self.multiprocess {
            Some(collector) => collector.encode_text(&self.registry).await,
            None => exposition::encode_text(&self.registry),
        };
        respond(encoded, TEXT_CONTENT_TYPE)
    }

    /// OpenMetrics text format, including exemplars.
    pub async fn handle_openmetrics(&self) -> Response {
        let encoded = match &self.multiprocess {
            Some(collector) => collector.encode_openmetrics(&self.registry).await,
            None => exposition::encode_openmetrics(&self.registry),
        };
        respond(encoded, OPENMETRICS_CONTENT_TYPE)
    }

    /// `/metrics` and `/openmetrics` routes serving this handler.
    pub fn router<S>(self) -> axum::Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let openmetrics = self.clone();
        axum::Router::new()
            .route(
                "/metrics",
                get(move || {
                    let handler = self.clone();
                    async move { handler.handle_metrics().await }
                }),
            )
            .route(
                "/openmetrics",
                get(move || {
                    let handler = openmetrics.clone();
                    async move { handler.handle_openmetrics().await }
                }),
            )
    }
}

fn respond(encoded: Result<String>, content_type: &'static str) -> Response {
    match encoded {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Serve the global registry in the Prometheus text format.
pub async fn handle_metrics() -> Response {
    MetricsHandler::from_env().handle_metrics().await
}

/// Serve the global registry in the OpenMetrics text format.
pub async fn handle_openmetrics() -> Response {
    MetricsHandler::from_env().handle_openmetrics().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use httpmeter_core::MetricKind;

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn registry() -> MetricsRegistry {
        let registry = MetricsRegistry::new();
        registry
            .get_or_create("demo_requests_total", "Total HTTP requests", MetricKind::Counter, &["path"])
            .unwrap()
            .as_counter()
            .unwrap()
            .inc(&["/200"])
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_handle_metrics() {
        let response = MetricsHandler::new(registry()).handle_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], TEXT_CONTENT_TYPE);
        assert!(body_text(response).await.contains(r#"demo_requests_total{path="/200"} 1"#));
    }

    #[tokio::test]
    async fn test_handle_openmetrics() {
        let response = MetricsHandler::new(registry()).handle_openmetrics().await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], OPENMETRICS_CONTENT_TYPE);
        let text = body_text(response).await;
        assert!(text.contains("# TYPE demo_requests counter"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn test_handle_metrics_multiprocess() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(MultiProcessCollector::new(dir.path()));
        let response = MetricsHandler::new(registry())
            .with_multiprocess(collector)
            .handle_metrics()
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains(r#"demo_requests_total{path="/200"} 1"#));
        assert!(dir.path().join(format!("metrics_{}.json", std::process::id())).exists());
    }
}
