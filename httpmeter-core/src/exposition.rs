//! Exposition formats
//!
//! Live metrics render straight from the registries: `prometheus::TextEncoder`
//! for the text format and `prometheus_client` for OpenMetrics. Snapshots are
//! the serializable form shared between worker processes; merged snapshots
//! go back through the same two encoders.

use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric, NoLabelSet};
use prometheus_client::metrics::counter::ConstCounter;
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::metrics::MetricType as OpenMetricsType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::MetricsRegistry;

pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
pub const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyKind {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilySnapshot {
    pub name: String,
    pub help: String,
    pub kind: FamilyKind,
    pub series: Vec<SeriesSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    /// Label pairs sorted by name.
    pub labels: Vec<(String, String)>,
    pub value: SeriesValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeriesValue {
    Scalar { value: f64 },
    Histogram {
        /// Finite buckets; the `+Inf` bucket equals `count`.
        buckets: Vec<BucketSnapshot>,
        count: u64,
        sum: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

/// Render the registry in the Prometheus text format (0.0.4).
pub fn encode_text(registry: &MetricsRegistry) -> Result<String> {
    encode_families(&registry.gather())
}

/// Render the registry in the OpenMetrics text format, with exemplars.
pub fn encode_openmetrics(registry: &MetricsRegistry) -> Result<String> {
    registry.encode_openmetrics()
}

fn encode_families(families: &[MetricFamily]) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Encoding(e.to_string()))
}

/// Convert gathered metric families into serializable snapshots.
pub fn snapshot(families: &[MetricFamily]) -> Vec<FamilySnapshot> {
    let mut snapshots = Vec::with_capacity(families.len());

    for family in families {
        let kind = match family.get_field_type() {
            MetricType::COUNTER => FamilyKind::Counter,
            MetricType::GAUGE => FamilyKind::Gauge,
            MetricType::HISTOGRAM => FamilyKind::Histogram,
            other => {
                tracing::debug!(family = family.name(), kind = ?other, "skipping unsupported metric type");
                continue;
            }
        };

        let series = family
            .get_metric()
            .iter()
            .map(|metric| {
                let mut labels: Vec<(String, String)> = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.name().to_string(), pair.value().to_string()))
                    .collect();
                labels.sort();

                let value = match kind {
                    FamilyKind::Counter => SeriesValue::Scalar {
                        value: metric.get_counter().value(),
                    },
                    FamilyKind::Gauge => SeriesValue::Scalar {
                        value: metric.get_gauge().value(),
                    },
                    FamilyKind::Histogram => {
                        let histogram = metric.get_histogram();
                        SeriesValue::Histogram {
                            buckets: histogram
                                .get_bucket()
                                .iter()
                                .filter(|b| b.upper_bound().is_finite())
                                .map(|b| BucketSnapshot {
                                    upper_bound: b.upper_bound(),
                                    cumulative_count: b.cumulative_count(),
                                })
                                .collect(),
                            count: histogram.get_sample_count(),
                            sum: histogram.get_sample_sum(),
                        }
                    }
                };
                SeriesSnapshot { labels, value }
            })
            .collect();

        snapshots.push(FamilySnapshot {
            name: family.name().to_string(),
            help: family.help().to_string(),
            kind,
            series,
        });
    }

    snapshots
}

/// Rebuild protobuf metric families from snapshots. Families without series
/// are left out, as the text encoder rejects them.
pub fn to_metric_families(families: &[FamilySnapshot]) -> Vec<MetricFamily> {
    families
        .iter()
        .filter(|family| !family.series.is_empty())
        .map(|family| {
            let mut out = MetricFamily::default();
            out.set_name(family.name.clone());
            out.set_help(family.help.clone());
            out.set_field_type(match family.kind {
                FamilyKind::Counter => MetricType::COUNTER,
                FamilyKind::Gauge => MetricType::GAUGE,
                FamilyKind::Histogram => MetricType::HISTOGRAM,
            });
            out.set_metric(family.series.iter().map(|series| to_metric(family.kind, series)).collect());
            out
        })
        .collect()
}

fn to_metric(kind: FamilyKind, series: &SeriesSnapshot) -> proto::Metric {
    let labels = series
        .labels
        .iter()
        .map(|(name, value)| {
            let mut pair = proto::LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(value.clone());
            pair
        })
        .collect();
    let mut metric = proto::Metric::from_label(labels);

    match (&series.value, kind) {
        (SeriesValue::Scalar { value }, FamilyKind::Counter) => {
            let mut counter = proto::Counter::default();
            counter.set_value(*value);
            metric.set_counter(counter);
        }
        (SeriesValue::Scalar { value }, _) => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(*value);
            metric.set_gauge(gauge);
        }
        (SeriesValue::Histogram { buckets, count, sum }, _) => {
            let mut histogram = proto::Histogram::default();
            histogram.set_sample_count(*count);
            histogram.set_sample_sum(*sum);
            histogram.set_bucket(
                buckets
                    .iter()
                    .map(|b| {
                        let mut bucket = proto::Bucket::default();
                        bucket.set_upper_bound(b.upper_bound);
                        bucket.set_cumulative_count(b.cumulative_count);
                        bucket
                    })
                    .collect(),
            );
            metric.set_histogram(histogram);
        }
    }
    metric
}

/// Render snapshots in the Prometheus text format (0.0.4).
pub fn encode_snapshots_text(families: &[FamilySnapshot]) -> Result<String> {
    encode_families(&to_metric_families(families))
}

/// Render snapshots in the OpenMetrics text format. Exemplars are not
/// persisted, so none appear here.
pub fn encode_snapshots_openmetrics(families: &[FamilySnapshot]) -> Result<String> {
    let mut registry = prometheus_client::registry::Registry::default();
    registry.register_collector(Box::new(SnapshotCollector(families.to_vec())));

    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &registry)
        .map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(buffer)
}

#[derive(Debug)]
struct SnapshotCollector(Vec<FamilySnapshot>);

impl Collector for SnapshotCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> std::result::Result<(), std::fmt::Error> {
        for family in self.0.iter().filter(|f| !f.series.is_empty()) {
            let (name, kind) = match family.kind {
                FamilyKind::Counter => (
                    family.name.strip_suffix("_total").unwrap_or(&family.name),
                    OpenMetricsType::Counter,
                ),
                FamilyKind::Gauge => (family.name.as_str(), OpenMetricsType::Gauge),
                FamilyKind::Histogram => (family.name.as_str(), OpenMetricsType::Histogram),
            };
            let mut family_encoder = encoder.encode_descriptor(name, &family.help, None, kind)?;

            for series in &family.series {
                let metric_encoder = family_encoder.encode_family(&series.labels)?;
                match (&series.value, family.kind) {
                    (SeriesValue::Scalar { value }, FamilyKind::Counter) => {
                        ConstCounter::new(*value).encode(metric_encoder)?;
                    }
                    (SeriesValue::Scalar { value }, _) => {
                        ConstGauge::new(*value).encode(metric_encoder)?;
                    }
                    (SeriesValue::Histogram { buckets, count, sum }, _) => {
                        let mut metric_encoder = metric_encoder;
                        metric_encoder.encode_histogram::<NoLabelSet>(
                            *sum,
                            *count,
                            &per_bucket_counts(buckets, *count),
                            None,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Cumulative snapshot buckets as per-bucket counts, `+Inf` last as `f64::MAX`.
fn per_bucket_counts(buckets: &[BucketSnapshot], count: u64) -> Vec<(f64, u64)> {
    let mut previous = 0;
    let mut out: Vec<(f64, u64)> = buckets
        .iter()
        .map(|b| {
            let n = b.cumulative_count.saturating_sub(previous);
            previous = b.cumulative_count;
            (b.upper_bound, n)
        })
        .collect();
    out.push((f64::MAX, count.saturating_sub(previous)));
    out
}
