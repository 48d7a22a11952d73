//! HTTP metrics middleware and exposition endpoints
//!
//! Wrap an application with [`PrometheusLayer`] and serve the collected
//! metrics with [`handle_metrics`] or [`handle_openmetrics`].

pub mod observability;

pub use observability::handlers::{handle_metrics, handle_openmetrics, MetricsHandler};
pub use observability::middleware::{ExemplarFn, PrometheusLayer, PrometheusLayerBuilder, PrometheusService};
