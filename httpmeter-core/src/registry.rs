//! Name-addressed metrics registry
//!
//! Hosting frameworks may construct the metrics layer more than once. Metrics
//! are therefore created through [`MetricsRegistry::get_or_create`], which
//! registers a name once and hands the same instance back afterwards.
//!
//! Every metric lives in two registries updated together: a
//! `prometheus::Registry` rendered in the text format (and snapshotted for
//! multi-process mode), and a `prometheus_client` registry rendered as
//! OpenMetrics, which carries exemplars natively.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, LazyLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use prometheus_client::metrics::exemplar::{CounterWithExemplar, HistogramWithExemplars};
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry as OpenMetricsRegistry;

use crate::error::{Error, Result};

/// Longest exemplar label set accepted by the OpenMetrics format, in characters.
const MAX_EXEMPLAR_CHARS: usize = 128;

static GLOBAL: LazyLock<MetricsRegistry> =
    LazyLock::new(|| MetricsRegistry::with_registry(prometheus::default_registry().clone()));

/// Ordered `(name, value)` label pairs, as used by `prometheus_client` families.
pub type LabelSet = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram { buckets: Vec<f64> },
}

impl MetricKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram { .. } => "histogram",
        }
    }
}

/// Creates each histogram series of a family with the family's buckets.
#[derive(Debug, Clone)]
pub struct HistogramBuckets(Arc<[f64]>);

impl MetricConstructor<HistogramWithExemplars<LabelSet>> for HistogramBuckets {
    fn new_metric(&self) -> HistogramWithExemplars<LabelSet> {
        HistogramWithExemplars::new(self.0.iter().copied())
    }
}

type CounterFamily = Family<LabelSet, CounterWithExemplar<LabelSet, f64>>;
type GaugeFamily = Family<LabelSet, Gauge<f64, AtomicU64>>;
type HistogramFamily = Family<LabelSet, HistogramWithExemplars<LabelSet>, HistogramBuckets>;

#[derive(Clone)]
struct Schema {
    name: Arc<str>,
    label_names: Arc<[String]>,
}

impl Schema {
    fn label_set(&self, values: &[&str]) -> Result<LabelSet> {
        if values.len() != self.label_names.len() {
            return Err(Error::Prometheus(prometheus::Error::InconsistentCardinality {
                expect: self.label_names.len(),
                got: values.len(),
            }));
        }
        Ok(self
            .label_names
            .iter()
            .zip(values)
            .map(|(name, value)| (name.clone(), (*value).to_string()))
            .collect())
    }

    /// Exemplar labels to attach, or `None` when there are none or they are
    /// too long for the OpenMetrics format.
    fn exemplar(&self, exemplar: Option<&[(String, String)]>) -> Option<LabelSet> {
        let exemplar = exemplar?;
        let chars: usize = exemplar
            .iter()
            .map(|(k, v)| k.chars().count() + v.chars().count())
            .sum();
        if chars > MAX_EXEMPLAR_CHARS {
            tracing::warn!(
                metric = %self.name,
                chars,
                "exemplar label set exceeds {MAX_EXEMPLAR_CHARS} characters, dropping it"
            );
            return None;
        }
        Some(exemplar.to_vec())
    }
}

#[derive(Clone)]
pub struct CounterHandle {
    schema: Schema,
    text: CounterVec,
    openmetrics: CounterFamily,
}

impl CounterHandle {
    pub fn inc(&self, values: &[&str]) -> Result<()> {
        self.inc_by(values, 1.0, None)
    }

    /// Add `amount` to the series for `values`, optionally replacing its exemplar.
    pub fn inc_by(&self, values: &[&str], amount: f64, exemplar: Option<&[(String, String)]>) -> Result<()> {
        let labels = self.schema.label_set(values)?;
        self.text.get_metric_with_label_values(values)?.inc_by(amount);
        self.openmetrics
            .get_or_create(&labels)
            .inc_by(amount, self.schema.exemplar(exemplar));
        Ok(())
    }

    pub fn get(&self, values: &[&str]) -> Result<f64> {
        Ok(self.text.get_metric_with_label_values(values)?.get())
    }
}

#[derive(Clone)]
pub struct GaugeHandle {
    schema: Schema,
    text: GaugeVec,
    openmetrics: GaugeFamily,
}

impl GaugeHandle {
    pub fn inc(&self, values: &[&str]) -> Result<()> {
        let labels = self.schema.label_set(values)?;
        self.text.get_metric_with_label_values(values)?.inc();
        self.openmetrics.get_or_create(&labels).inc();
        Ok(())
    }

    pub fn dec(&self, values: &[&str]) -> Result<()> {
        let labels = self.schema.label_set(values)?;
        self.text.get_metric_with_label_values(values)?.dec();
        self.openmetrics.get_or_create(&labels).dec();
        Ok(())
    }

    pub fn get(&self, values: &[&str]) -> Result<f64> {
        Ok(self.text.get_metric_with_label_values(values)?.get())
    }
}

#[derive(Clone)]
pub struct HistogramHandle {
    schema: Schema,
    text: HistogramVec,
    openmetrics: HistogramFamily,
}

impl HistogramHandle {
    /// Record `value`; an exemplar is attached to the bucket `value` falls in.
    pub fn observe(&self, values: &[&str], value: f64, exemplar: Option<&[(String, String)]>) -> Result<()> {
        let labels = self.schema.label_set(values)?;
        self.text.get_metric_with_label_values(values)?.observe(value);
        self.openmetrics
            .get_or_create(&labels)
            .observe(value, self.schema.exemplar(exemplar));
        Ok(())
    }

    pub fn sample_count(&self, values: &[&str]) -> Result<u64> {
        Ok(self.text.get_metric_with_label_values(values)?.get_sample_count())
    }
}

#[derive(Clone)]
pub enum MetricHandle {
    Counter(CounterHandle),
    Gauge(GaugeHandle),
    Histogram(HistogramHandle),
}

impl MetricHandle {
    pub fn as_counter(&self) -> Option<&CounterHandle> {
        match self {
            Self::Counter(counter) => Some(counter),
            _ => None,
        }
    }

    pub fn as_gauge(&self) -> Option<&GaugeHandle> {
        match self {
            Self::Gauge(gauge) => Some(gauge),
            _ => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&HistogramHandle> {
        match self {
            Self::Histogram(histogram) => Some(histogram),
            _ => None,
        }
    }

    fn register_openmetrics(&self, registry: &mut OpenMetricsRegistry, name: &str, help: &str) {
        match self {
            Self::Counter(counter) => {
                // the OpenMetrics encoder appends `_total` to counter samples
                let base = name.strip_suffix("_total").unwrap_or(name);
                registry.register(base, help, counter.openmetrics.clone());
            }
            Self::Gauge(gauge) => registry.register(name, help, gauge.openmetrics.clone()),
            Self::Histogram(histogram) => registry.register(name, help, histogram.openmetrics.clone()),
        }
    }

    fn collector(&self) -> Box<dyn Collector> {
        match self {
            Self::Counter(counter) => Box::new(counter.text.clone()),
            Self::Gauge(gauge) => Box::new(gauge.text.clone()),
            Self::Histogram(histogram) => Box::new(histogram.text.clone()),
        }
    }
}

struct RegisteredMetric {
    kind: MetricKind,
    label_names: Vec<String>,
    handle: MetricHandle,
}

struct Inner {
    registry: Registry,
    openmetrics: RwLock<OpenMetricsRegistry>,
    metrics: DashMap<String, RegisteredMetric>,
}

/// Shared handle to the registries plus the metrics created on them.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.inner.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("MetricsRegistry").field("metrics", &names).finish()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Registry backed by a fresh, private `prometheus::Registry`.
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                openmetrics: RwLock::new(OpenMetricsRegistry::default()),
                metrics: DashMap::new(),
            }),
        }
    }

    /// Process-wide registry backed by `prometheus::default_registry()`.
    pub fn global() -> &'static MetricsRegistry {
        &GLOBAL
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.registry.gather()
    }

    /// Render every metric, with exemplars, in the OpenMetrics text format.
    pub fn encode_openmetrics(&self) -> Result<String> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.openmetrics.read())
            .map_err(|e| Error::Encoding(e.to_string()))?;
        Ok(buffer)
    }

    /// Fetch the metric called `name`, creating and registering it on first use.
    ///
    /// The kind and label names of an existing metric must match the request;
    /// bucket boundaries of an existing histogram are kept as first created.
    pub fn get_or_create(
        &self,
        name: &str,
        help: &str,
        kind: MetricKind,
        label_names: &[&str],
    ) -> Result<MetricHandle> {
        match self.inner.metrics.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                let same_kind = existing.kind.name() == kind.name();
                if !same_kind || existing.label_names.iter().map(String::as_str).ne(label_names.iter().copied()) {
                    return Err(Error::LabelSchemaMismatch {
                        name: name.to_string(),
                        existing: format!("{} {:?}", existing.kind.name(), existing.label_names),
                        requested: format!("{} {label_names:?}", kind.name()),
                    });
                }
                Ok(existing.handle.clone())
            }
            Entry::Vacant(entry) => {
                let schema = Schema {
                    name: Arc::from(name),
                    label_names: label_names.iter().map(|s| (*s).to_string()).collect(),
                };
                let handle = match &kind {
                    MetricKind::Counter => {
                        let text = CounterVec::new(Opts::new(name, help), label_names)?;
                        let family = CounterFamily::default();
                        MetricHandle::Counter(CounterHandle {
                            schema,
                            text,
                            openmetrics: family,
                        })
                    }
                    MetricKind::Gauge => {
                        let text = GaugeVec::new(Opts::new(name, help), label_names)?;
                        let family = GaugeFamily::default();
                        MetricHandle::Gauge(GaugeHandle {
                            schema,
                            text,
                            openmetrics: family,
                        })
                    }
                    MetricKind::Histogram { buckets } => {
                        let text = HistogramVec::new(
                            HistogramOpts::new(name, help).buckets(buckets.clone()),
                            label_names,
                        )?;
                        let family = HistogramFamily::new_with_constructor(HistogramBuckets(Arc::from(
                            buckets.as_slice(),
                        )));
                        MetricHandle::Histogram(HistogramHandle {
                            schema,
                            text,
                            openmetrics: family,
                        })
                    }
                };
                self.inner.registry.register(handle.collector())?;
                handle.register_openmetrics(&mut self.inner.openmetrics.write(), name, help);
                tracing::debug!(metric = name, kind = kind.name(), "registered metric");

                entry.insert(RegisteredMetric {
                    kind,
                    label_names: label_names.iter().map(|s| (*s).to_string()).collect(),
                    handle: handle.clone(),
                });
                Ok(handle)
            }
        }
    }
}
