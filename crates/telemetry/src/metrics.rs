//! Internal metrics collection.
//!
//! Collects metrics in-memory on atomics; workers flush snapshots to the
//! log stream on an interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the rollup engine.
#[derive(Debug, Default)]
pub struct Metrics {
    // Ingestion
    pub batches_ingested: Counter,
    pub records_ingested: Counter,
    pub batches_rejected: Counter,
    pub overload_rejections: Counter,

    // Incremental rollup
    pub rollup_batches_applied: Counter,
    pub rollup_rows_merged: Counter,
    pub rollup_replays_skipped: Counter,
    pub merge_conflicts: Counter,

    // Scheduled recompute
    pub recompute_cycles: Counter,
    pub recompute_skips: Counter,
    pub recompute_timeouts: Counter,
    pub recompute_failures: Counter,

    // Retention
    pub retention_passes: Counter,
    pub retention_partitions_dropped: Counter,
    pub retention_partitions_downsampled: Counter,
    pub retention_deferrals: Counter,
    pub base_rows_deleted: Counter,
    pub summary_rows_written: Counter,
    pub aggregate_rows_pruned: Counter,

    // Latency histograms
    pub ingest_latency_ms: Histogram,
    pub rollup_apply_latency_ms: Histogram,
    pub recompute_duration_ms: Histogram,
    pub retention_pass_ms: Histogram,

    // Gauges
    pub rollup_queue_depth: Gauge,
    pub backpressure_active: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            batches_ingested: self.batches_ingested.get(),
            records_ingested: self.records_ingested.get(),
            batches_rejected: self.batches_rejected.get(),
            overload_rejections: self.overload_rejections.get(),
            rollup_batches_applied: self.rollup_batches_applied.get(),
            rollup_rows_merged: self.rollup_rows_merged.get(),
            rollup_replays_skipped: self.rollup_replays_skipped.get(),
            merge_conflicts: self.merge_conflicts.get(),
            recompute_cycles: self.recompute_cycles.get(),
            recompute_skips: self.recompute_skips.get(),
            recompute_timeouts: self.recompute_timeouts.get(),
            recompute_failures: self.recompute_failures.get(),
            retention_passes: self.retention_passes.get(),
            retention_partitions_dropped: self.retention_partitions_dropped.get(),
            retention_partitions_downsampled: self.retention_partitions_downsampled.get(),
            retention_deferrals: self.retention_deferrals.get(),
            base_rows_deleted: self.base_rows_deleted.get(),
            summary_rows_written: self.summary_rows_written.get(),
            aggregate_rows_pruned: self.aggregate_rows_pruned.get(),
            ingest_latency_mean_ms: self.ingest_latency_ms.mean(),
            rollup_apply_latency_mean_ms: self.rollup_apply_latency_ms.mean(),
            recompute_duration_mean_ms: self.recompute_duration_ms.mean(),
            rollup_queue_depth: self.rollup_queue_depth.get(),
            backpressure_active: self.backpressure_active.get() > 0,
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub batches_ingested: u64,
    pub records_ingested: u64,
    pub batches_rejected: u64,
    pub overload_rejections: u64,
    pub rollup_batches_applied: u64,
    pub rollup_rows_merged: u64,
    pub rollup_replays_skipped: u64,
    pub merge_conflicts: u64,
    pub recompute_cycles: u64,
    pub recompute_skips: u64,
    pub recompute_timeouts: u64,
    pub recompute_failures: u64,
    pub retention_passes: u64,
    pub retention_partitions_dropped: u64,
    pub retention_partitions_downsampled: u64,
    pub retention_deferrals: u64,
    pub base_rows_deleted: u64,
    pub summary_rows_written: u64,
    pub aggregate_rows_pruned: u64,
    pub ingest_latency_mean_ms: f64,
    pub rollup_apply_latency_mean_ms: f64,
    pub recompute_duration_mean_ms: f64,
    pub rollup_queue_depth: u64,
    pub backpressure_active: bool,
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
