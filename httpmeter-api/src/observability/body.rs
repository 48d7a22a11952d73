//! Response body wrapper that finalizes request metrics.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Frame, SizeHint};

use super::middleware::RequestTracker;

/// Forwards frames unmodified, noting when data was last sent.
///
/// Metrics are recorded when the body reaches its end, or when it is
/// dropped before that.
pub struct MetricsBody {
    inner: Body,
    tracker: Option<RequestTracker>,
}

impl MetricsBody {
    pub(crate) fn new(inner: Body, tracker: RequestTracker) -> Self {
        Self {
            inner,
            tracker: Some(tracker),
        }
    }

    fn complete(&mut self) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.on_end();
        }
    }
}

impl http_body::Body for MetricsBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(tracker)) = (frame.data_ref(), this.tracker.as_mut()) {
                    tracker.on_data(data.len());
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::body::Body;
    use bytes::Bytes;
    use futures::stream;
    use http::{Request, Response};
    use http_body_util::BodyExt;
    use httpmeter_core::exposition::{snapshot, SeriesValue};
    use httpmeter_core::{ExporterConfig, MetricsRegistry};
    use tower::{service_fn, Layer, ServiceExt};

    use crate::PrometheusLayer;

    fn requests_total(registry: &MetricsRegistry) -> f64 {
        snapshot(&registry.gather())
            .iter()
            .filter(|family| family.name == "starlette_requests_total")
            .flat_map(|family| family.series.iter())
            .map(|series| match series.value {
                SeriesValue::Scalar { value } => value,
                SeriesValue::Histogram { .. } => 0.0,
            })
            .sum()
    }

    fn layer(registry: &MetricsRegistry) -> PrometheusLayer {
        PrometheusLayer::builder()
            .config(ExporterConfig {
                group_paths: false,
                filter_unhandled_paths: false,
                ..ExporterConfig::default()
            })
            .registry(registry.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_body_forwarded_and_recorded_at_end() {
        let registry = MetricsRegistry::new();
        let service = layer(&registry).layer(service_fn(|_req: Request<Body>| async {
            let chunks = stream::iter(vec![
                Ok::<_, Infallible>(Bytes::from_static(b"hello ")),
                Ok(Bytes::from_static(b"world")),
            ]);
            Ok::<_, Infallible>(Response::new(Body::from_stream(chunks)))
        }));

        let response = service
            .oneshot(Request::get("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(requests_total(&registry), 0.0);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"hello world"));
        assert_eq!(requests_total(&registry), 1.0);
    }

    #[tokio::test]
    async fn test_dropped_body_still_recorded() {
        let registry = MetricsRegistry::new();
        let service = layer(&registry).layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("unread")))
        }));

        let response = service
            .oneshot(Request::get("/drop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        drop(response);
        assert_eq!(requests_total(&registry), 1.0);
    }
}
