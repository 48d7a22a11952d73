pub mod config;
pub mod error;
pub mod exposition;
pub mod labels;
pub mod logging;
pub mod multiprocess;
pub mod registry;
pub mod routing;

pub use config::{ExporterConfig, LoggingConfig, OptionalMetric};
pub use error::{Error, Result};
pub use labels::{from_header, from_response_header, BoxError, LabelSource, RequestLabel, ResponseHeaderLabel};
pub use multiprocess::MultiProcessCollector;
pub use registry::{MetricHandle, MetricKind, MetricsRegistry};
pub use routing::{Mount, RequestScope, Route, RouteNode, Router};
