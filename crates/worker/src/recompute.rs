//! Scheduled recompute engine.
//!
//! Re-derives a scheduled definition's full result set from a single
//! read-consistent snapshot of base data, stages it locally, then publishes
//! it with an atomic pointer swap. A tick that fires during an active cycle
//! is skipped, not queued. A cycle that overruns its deadline aborts with
//! the staging discarded and the previous published result untouched.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use aggregate_store::{AggregateRow, AggregateStore, BaseStore};
use rollup_core::fold::{fold_rows, PartialRows};
use rollup_core::{AggregateDefinition, Error, Result, ScheduledSpec};
use telemetry::metrics;

/// Outcome of one recompute invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { rows: usize, elapsed_ms: u64 },
    /// A cycle was already in flight; this tick did nothing.
    Skipped,
}

/// Executes recompute cycles for scheduled definitions.
pub struct RecomputeEngine {
    base: Arc<dyn BaseStore>,
    aggregates: Arc<AggregateStore>,
}

impl RecomputeEngine {
    pub fn new(base: Arc<dyn BaseStore>, aggregates: Arc<AggregateStore>) -> Self {
        Self { base, aggregates }
    }

    /// Timer-driven or on-demand recompute using the definition's own
    /// deadline.
    pub async fn recompute(&self, def: &Arc<AggregateDefinition>) -> Result<CycleOutcome> {
        let spec = def
            .scheduled_spec()
            .ok_or_else(|| Error::internal(format!("'{}' is not scheduled", def.name)))?;
        self.recompute_with_deadline(def, spec.deadline()).await
    }

    /// On-demand recompute with an explicit deadline override.
    pub async fn recompute_with_deadline(
        &self,
        def: &Arc<AggregateDefinition>,
        deadline: Duration,
    ) -> Result<CycleOutcome> {
        let spec = def
            .scheduled_spec()
            .ok_or_else(|| Error::internal(format!("'{}' is not scheduled", def.name)))?;

        if !self.aggregates.begin_recompute(&def.name)? {
            metrics().recompute_skips.inc();
            info!(definition = %def.name, "Recompute already in flight, skipping tick");
            return Ok(CycleOutcome::Skipped);
        }

        let result = self.run_cycle(def, spec, deadline).await;
        self.aggregates.finish_recompute(&def.name)?;

        match &result {
            Ok(CycleOutcome::Completed { rows, elapsed_ms }) => {
                metrics().recompute_cycles.inc();
                metrics().recompute_duration_ms.observe(*elapsed_ms);
                info!(
                    definition = %def.name,
                    rows = rows,
                    elapsed_ms = elapsed_ms,
                    "Recompute published"
                );
            }
            Ok(CycleOutcome::Skipped) => {}
            Err(Error::RecomputeTimeout { elapsed_ms, .. }) => {
                metrics().recompute_timeouts.inc();
                warn!(
                    definition = %def.name,
                    elapsed_ms = elapsed_ms,
                    "Recompute aborted on deadline, previous result stands"
                );
            }
            Err(e) => {
                metrics().recompute_failures.inc();
                warn!(definition = %def.name, error = %e, "Recompute failed");
            }
        }

        result
    }

    async fn run_cycle(
        &self,
        def: &Arc<AggregateDefinition>,
        spec: &ScheduledSpec,
        deadline: Duration,
    ) -> Result<CycleOutcome> {
        let started = Instant::now();
        let overrun = |started: Instant| -> Result<()> {
            let elapsed = started.elapsed();
            if elapsed > deadline {
                Err(Error::recompute_timeout(
                    &def.name,
                    elapsed.as_millis() as u64,
                ))
            } else {
                Ok(())
            }
        };

        let now = Utc::now();
        let window_start = now - spec.window();
        let snapshot = self.base.snapshot(def.stream, Some(window_start)).await?;
        debug!(
            definition = %def.name,
            partitions = snapshot.partitions().len(),
            rows = snapshot.row_count(),
            "Recompute cycle started"
        );

        // Stage the fold partition by partition, checking the deadline
        // between partitions so an overrunning cycle aborts without
        // publishing.
        let mut staged = PartialRows::new();
        for partition in snapshot.partitions() {
            overrun(started)?;
            let folded = fold_rows(
                def,
                partition.rows.iter().filter(|r| r.timestamp() >= window_start),
            );
            for (group, values) in folded {
                match staged.entry(group) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        for (acc, value) in entry.get_mut().iter_mut().zip(values.iter()) {
                            acc.merge(value)?;
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(values);
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        overrun(started)?;

        let mut rows: Vec<AggregateRow> = staged
            .into_iter()
            .map(|(group, values)| AggregateRow { group, values })
            .collect();

        match spec.order_by.as_deref().and_then(|m| def.measure_index(m)) {
            Some(rank_idx) => rows.sort_by(|a, b| {
                let (va, vb) = (a.values[rank_idx].finalize(), b.values[rank_idx].finalize());
                vb.partial_cmp(&va)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.group.cmp(&b.group))
            }),
            None => rows.sort_by(|a, b| a.group.cmp(&b.group)),
        }
        if let Some(limit) = spec.limit {
            rows.truncate(limit);
        }

        let row_count = rows.len();
        self.aggregates.publish(def, rows, now)?;

        Ok(CycleOutcome::Completed {
            rows: row_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
