//! Multi-process aggregation through snapshot files
//!
//! Each worker process periodically writes a snapshot of its registry into a
//! shared directory. Scrapes merge every snapshot in that directory: counters,
//! gauges (live sum) and histograms are summed series by series.
//!
//! When a worker exits its counters and histograms are folded into a shared
//! archive snapshot so totals never go backwards, while its gauges are dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::exposition::{self, BucketSnapshot, FamilyKind, FamilySnapshot, SeriesSnapshot, SeriesValue};
use crate::registry::MetricsRegistry;

/// Environment variables that enable multi-process mode; the first set one wins.
pub const MULTIPROC_DIR_ENV: [&str; 2] = ["PROMETHEUS_MULTIPROC_DIR", "prometheus_multiproc_dir"];

const SNAPSHOT_PREFIX: &str = "metrics_";
const SNAPSHOT_EXT: &str = "json";
const ARCHIVE_NAME: &str = "archive";

/// Reads and writes per-process snapshot files in a shared directory.
#[derive(Debug)]
pub struct MultiProcessCollector {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl MultiProcessCollector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Collector for the directory named by the multi-process environment
    /// variable, if one is set.
    pub fn from_env() -> Option<Self> {
        MULTIPROC_DIR_ENV
            .iter()
            .find_map(|key| std::env::var_os(key))
            .filter(|dir| !dir.is_empty())
            .map(Self::new)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, name: impl std::fmt::Display) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_PREFIX}{name}.{SNAPSHOT_EXT}"))
    }

    /// Replace `target` with `families` via a staging file and a rename.
    async fn write_snapshot(&self, target: &Path, families: &[FamilySnapshot]) -> Result<()> {
        let encoded = serde_json::to_vec(families)?;
        let staging = self
            .dir
            .join(format!(".{SNAPSHOT_PREFIX}{}.tmp", std::process::id()));

        fs::create_dir_all(&self.dir).await?;
        fs::write(&staging, encoded).await?;
        fs::rename(&staging, target).await?;
        Ok(())
    }

    async fn read_snapshot(path: &Path) -> Result<Vec<FamilySnapshot>> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write this process's snapshot, replacing the previous one atomically.
    pub async fn persist(&self, registry: &MetricsRegistry) -> Result<()> {
        let families = exposition::snapshot(&registry.gather());
        let target = self.snapshot_path(std::process::id());

        let _guard = self.write_lock.lock().await;
        self.write_snapshot(&target, &families).await
    }

    /// Retire the snapshot of a process that has exited.
    ///
    /// Its counters and histograms are merged into the archive snapshot; its
    /// gauges describe live state and are discarded.
    pub async fn mark_process_dead(&self, pid: u32) -> Result<()> {
        let path = self.snapshot_path(pid);
        let _guard = self.write_lock.lock().await;

        let families = match Self::read_snapshot(&path).await {
            Ok(families) => families,
            Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let retained: Vec<FamilySnapshot> = families
            .into_iter()
            .filter(|family| family.kind != FamilyKind::Gauge)
            .collect();

        let archive_path = self.snapshot_path(ARCHIVE_NAME);
        let archived = match Self::read_snapshot(&archive_path).await {
            Ok(families) => families,
            Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %archive_path.display(), error = %e, "replacing unreadable metrics archive");
                Vec::new()
            }
        };

        self.write_snapshot(&archive_path, &merge(vec![archived, retained]))
            .await?;
        fs::remove_file(&path).await?;
        tracing::debug!(pid, "archived metrics of exited process");
        Ok(())
    }

    /// Merge every snapshot in the directory.
    ///
    /// Unreadable snapshots are skipped with a warning so one corrupt file
    /// does not take the whole scrape down.
    pub async fn collect(&self) -> Result<Vec<FamilySnapshot>> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX));
            if is_snapshot {
                paths.push(path);
            }
        }
        paths.sort();

        let mut snapshots = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_snapshot(&path).await {
                Ok(families) => snapshots.push(families),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable metrics snapshot");
                }
            }
        }

        Ok(merge(snapshots))
    }

    /// Persist the current snapshot, then render the merged view as text.
    pub async fn encode_text(&self, registry: &MetricsRegistry) -> Result<String> {
        self.persist(registry).await?;
        exposition::encode_snapshots_text(&self.collect().await?)
    }

    /// Persist the current snapshot, then render the merged view as OpenMetrics.
    pub async fn encode_openmetrics(&self, registry: &MetricsRegistry) -> Result<String> {
        self.persist(registry).await?;
        exposition::encode_snapshots_openmetrics(&self.collect().await?)
    }
}

/// Periodically persist `registry` until the returned task is aborted.
pub fn spawn_flush_task(
    collector: Arc<MultiProcessCollector>,
    registry: MetricsRegistry,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = collector.persist(&registry).await {
                tracing::warn!(error = %e, dir = %collector.dir().display(), "failed to persist metrics snapshot");
            }
        }
    })
}

fn merge_value(into: &mut SeriesValue, from: &SeriesValue) {
    match (into, from) {
        (SeriesValue::Scalar { value }, SeriesValue::Scalar { value: other }) => *value += other,
        (
            SeriesValue::Histogram { buckets, count, sum },
            SeriesValue::Histogram {
                buckets: other_buckets,
                count: other_count,
                sum: other_sum,
            },
        ) => {
            *count += other_count;
            *sum += other_sum;
            for other in other_buckets {
                match buckets.iter_mut().find(|b| b.upper_bound == other.upper_bound) {
                    Some(bucket) => bucket.cumulative_count += other.cumulative_count,
                    None => buckets.push(BucketSnapshot {
                        upper_bound: other.upper_bound,
                        cumulative_count: other.cumulative_count,
                    }),
                }
            }
            buckets.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
        }
        (into, from) => {
            tracing::warn!(?into, ?from, "cannot merge series of different kinds");
        }
    }
}

/// Merge per-process snapshots family by family and series by series.
pub fn merge(snapshots: Vec<Vec<FamilySnapshot>>) -> Vec<FamilySnapshot> {
    let mut families: BTreeMap<String, FamilySnapshot> = BTreeMap::new();

    for family in snapshots.into_iter().flatten() {
        let Some(merged) = families.get_mut(&family.name) else {
            families.insert(family.name.clone(), family);
            continue;
        };
        if merged.kind != family.kind {
            tracing::warn!(family = %family.name, "metric kind differs between processes, skipping");
            continue;
        }
        for series in family.series {
            match merged.series.iter_mut().find(|s| s.labels == series.labels) {
                Some(existing) => merge_value(&mut existing.value, &series.value),
                None => merged.series.push(SeriesSnapshot {
                    labels: series.labels,
                    value: series.value,
                }),
            }
        }
    }

    families.into_values().collect()
}
