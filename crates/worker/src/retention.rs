//! Retention worker for partition-granular lifecycle enforcement.
//!
//! Operates on whole monthly partitions rather than individual records. For
//! a downsample-then-delete policy, partitions past the downsample age are
//! rewritten into hourly summary rows; partitions past max_age are dropped
//! outright. Rewrites respect live recompute snapshots and defer pinned
//! partitions to the next pass; drops always proceed because snapshots hold
//! copy-on-write references. The pass also prunes time-bucketed aggregate
//! rows past their own retention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use aggregate_store::{AggregateStore, BaseStore};
use rollup_core::{
    AggregateRegistry, Error, EventSummary, Granularity, OrderSummary, PartitionId, Result,
    RetentionPolicy, RetentionReport, StoredRow, StreamKind,
};
use telemetry::metrics;

/// Per-stream retention policies.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub events: RetentionPolicy,
    pub orders: RetentionPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            // High-volume stream: hourly summaries after 30 days, gone after
            // 90.
            events: RetentionPolicy::downsample_then_delete(30 * 24, 90 * 24),
            // Orders are low volume and feed a 30-day ranking window; keep
            // raw for a year.
            orders: RetentionPolicy::delete_after(365 * 24),
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self, stream: StreamKind) -> &RetentionPolicy {
        match stream {
            StreamKind::Events => &self.events,
            StreamKind::Orders => &self.orders,
        }
    }

    pub fn max_age_hours(&self, stream: StreamKind) -> u64 {
        self.policy(stream).max_age_hours
    }

    pub fn validate(&self) -> Result<()> {
        self.events.validate()?;
        self.orders.validate()
    }
}

/// Worker that enforces retention policies.
pub struct RetentionWorker {
    base: Arc<dyn BaseStore>,
    aggregates: Arc<AggregateStore>,
    registry: Arc<AggregateRegistry>,
    config: RetentionConfig,
}

impl RetentionWorker {
    pub fn new(
        base: Arc<dyn BaseStore>,
        aggregates: Arc<AggregateStore>,
        registry: Arc<AggregateRegistry>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            base,
            aggregates,
            registry,
            config,
        }
    }

    /// Runs one full retention pass across both streams and the aggregate
    /// stores.
    pub async fn run(&self) -> Result<RetentionReport> {
        let start = Instant::now();
        info!("Running retention pass");

        let mut report = RetentionReport::default();
        for stream in StreamKind::ALL {
            let stream_report = self.enforce(stream, self.config.policy(stream)).await?;
            report.absorb(&stream_report);
        }
        report.aggregate_rows_pruned = self.prune_aggregate_rows()?;

        metrics().retention_passes.inc();
        metrics()
            .retention_partitions_dropped
            .inc_by(report.partitions_dropped);
        metrics()
            .retention_partitions_downsampled
            .inc_by(report.partitions_downsampled);
        metrics().base_rows_deleted.inc_by(report.rows_deleted);
        metrics()
            .summary_rows_written
            .inc_by(report.summary_rows_written);
        metrics()
            .aggregate_rows_pruned
            .inc_by(report.aggregate_rows_pruned);
        metrics()
            .retention_pass_ms
            .observe(start.elapsed().as_millis() as u64);

        info!(
            partitions_dropped = report.partitions_dropped,
            partitions_downsampled = report.partitions_downsampled,
            partitions_deferred = report.partitions_deferred,
            rows_deleted = report.rows_deleted,
            summary_rows_written = report.summary_rows_written,
            aggregate_rows_pruned = report.aggregate_rows_pruned,
            "Retention pass complete"
        );
        Ok(report)
    }

    /// Enforces one stream's policy. Downsampling runs before deletion so a
    /// partition crossing both thresholds in one pass is summarized first.
    pub async fn enforce(
        &self,
        stream: StreamKind,
        policy: &RetentionPolicy,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let now = Utc::now();
        let mut report = RetentionReport::default();

        if let Some(downsample_hours) =
            policy.downsamples().then_some(policy.downsample_after_hours).flatten()
        {
            let cutoff = cutoff_partition(now, downsample_hours);
            for meta in self.base.partitions(stream).await? {
                if meta.id >= cutoff || meta.downsampled {
                    continue;
                }
                match self.downsample_partition(stream, meta.id).await {
                    Ok((removed, written)) => {
                        report.partitions_downsampled += 1;
                        report.rows_deleted += removed.saturating_sub(written);
                        report.summary_rows_written += written;
                        info!(
                            stream = stream.as_str(),
                            partition = %meta.id,
                            raw_rows = removed,
                            summary_rows = written,
                            "Partition downsampled"
                        );
                    }
                    Err(Error::RetentionRace { .. }) => {
                        report.partitions_deferred += 1;
                        metrics().retention_deferrals.inc();
                        info!(
                            stream = stream.as_str(),
                            partition = %meta.id,
                            "Partition pinned by a recompute snapshot, deferring"
                        );
                    }
                    Err(e) => {
                        warn!(
                            stream = stream.as_str(),
                            partition = %meta.id,
                            error = %e,
                            "Failed to downsample partition"
                        );
                    }
                }
            }
        }

        let cutoff = cutoff_partition(now, policy.max_age_hours);
        for meta in self.base.partitions(stream).await? {
            if meta.id >= cutoff {
                continue;
            }
            match self.base.drop_partition(stream, meta.id).await {
                Ok(rows) => {
                    report.partitions_dropped += 1;
                    report.rows_deleted += rows;
                    info!(
                        stream = stream.as_str(),
                        partition = %meta.id,
                        rows = rows,
                        "Partition dropped"
                    );
                }
                Err(e) => {
                    warn!(
                        stream = stream.as_str(),
                        partition = %meta.id,
                        error = %e,
                        "Failed to drop partition"
                    );
                }
            }
        }

        if report.is_noop() {
            debug!(stream = stream.as_str(), "No partitions past retention");
        }
        Ok(report)
    }

    async fn downsample_partition(
        &self,
        stream: StreamKind,
        id: PartitionId,
    ) -> Result<(u64, u64)> {
        let rows = self.base.partition_rows(stream, id).await?;
        let summaries = downsample_rows(stream, &rows);
        self.base.replace_partition(stream, id, summaries).await
    }

    /// Prunes incremental aggregate rows whose leading time bucket passed
    /// the definition's own retention.
    fn prune_aggregate_rows(&self) -> Result<u64> {
        let now = Utc::now();
        let mut pruned = 0;
        for def in self.registry.all() {
            let Some(retention) = def.retention else {
                continue;
            };
            if !def.is_incremental() {
                continue;
            }
            let cutoff = now - Duration::hours(retention.max_age_hours as i64);
            let dropped = self.aggregates.prune_rows_before(def, cutoff)?;
            if dropped > 0 {
                info!(
                    definition = %def.name,
                    rows = dropped,
                    "Pruned aggregate rows past retention"
                );
            }
            pruned += dropped;
        }
        Ok(pruned)
    }
}

/// Partitions strictly older than this id have passed the age threshold.
///
/// Partition granularity is monthly, so the cutoff is the partition of
/// `now - age`: a partition is only actioned once every row in it is at
/// least as old as the threshold.
fn cutoff_partition(now: DateTime<Utc>, age_hours: u64) -> PartitionId {
    PartitionId::of(now - Duration::hours(age_hours as i64))
}

/// Regroups a partition's rows into hourly summary rows. Sum/count measures
/// are preserved exactly; distinct users within sketch error.
pub fn downsample_rows(stream: StreamKind, rows: &[StoredRow]) -> Vec<StoredRow> {
    match stream {
        StreamKind::Events => downsample_events(rows),
        StreamKind::Orders => downsample_orders(rows),
    }
}

fn downsample_events(rows: &[StoredRow]) -> Vec<StoredRow> {
    let mut groups: BTreeMap<(DateTime<Utc>, &'static str, String), EventSummary> =
        BTreeMap::new();

    for row in rows {
        match row {
            StoredRow::Event(e) => {
                let bucket = Granularity::Hour.truncate(e.timestamp);
                let summary = groups
                    .entry((bucket, e.event_type.as_str(), e.country.clone()))
                    .or_insert_with(|| EventSummary {
                        bucket,
                        event_type: e.event_type,
                        country: e.country.clone(),
                        row_count: 0,
                        total_revenue: 0.0,
                        total_duration: 0.0,
                        users: Default::default(),
                    });
                summary.row_count += 1;
                summary.total_revenue += e.revenue;
                summary.total_duration += e.duration_seconds;
                summary.users.insert(&e.user_id);
            }
            StoredRow::EventSummary(s) => {
                // Re-downsampling is a merge, not a recount.
                let summary = groups
                    .entry((s.bucket, s.event_type.as_str(), s.country.clone()))
                    .or_insert_with(|| EventSummary {
                        bucket: s.bucket,
                        event_type: s.event_type,
                        country: s.country.clone(),
                        row_count: 0,
                        total_revenue: 0.0,
                        total_duration: 0.0,
                        users: Default::default(),
                    });
                summary.row_count += s.row_count;
                summary.total_revenue += s.total_revenue;
                summary.total_duration += s.total_duration;
                summary.users.union(&s.users);
            }
            _ => {}
        }
    }

    groups
        .into_values()
        .map(StoredRow::EventSummary)
        .collect()
}

fn downsample_orders(rows: &[StoredRow]) -> Vec<StoredRow> {
    let mut groups: BTreeMap<(DateTime<Utc>, &'static str, String), OrderSummary> =
        BTreeMap::new();

    for row in rows {
        match row {
            StoredRow::Order(o) => {
                let bucket = Granularity::Hour.truncate(o.timestamp);
                let summary = groups
                    .entry((bucket, o.status.as_str(), o.payment_method.clone()))
                    .or_insert_with(|| OrderSummary {
                        bucket,
                        status: o.status,
                        payment_method: o.payment_method.clone(),
                        row_count: 0,
                        total_amount: 0.0,
                        total_quantity: 0,
                        users: Default::default(),
                    });
                summary.row_count += 1;
                summary.total_amount += o.total_amount;
                summary.total_quantity += o.quantity as u64;
                summary.users.insert(&o.user_id);
            }
            StoredRow::OrderSummary(s) => {
                let summary = groups
                    .entry((s.bucket, s.status.as_str(), s.payment_method.clone()))
                    .or_insert_with(|| OrderSummary {
                        bucket: s.bucket,
                        status: s.status,
                        payment_method: s.payment_method.clone(),
                        row_count: 0,
                        total_amount: 0.0,
                        total_quantity: 0,
                        users: Default::default(),
                    });
                summary.row_count += s.row_count;
                summary.total_amount += s.total_amount;
                summary.total_quantity += s.total_quantity;
                summary.users.union(&s.users);
            }
            _ => {}
        }
    }

    groups.into_values().map(StoredRow::OrderSummary).collect()
}
