//! Incremental rollup worker.
//!
//! One worker per incremental definition consumes that definition's queue
//! in BatchId order: pre-aggregate the batch, then merge it into the
//! aggregate store. Merge contention is retried with bounded backoff and
//! never surfaced; a batch at or below the watermark is a logged no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info};

use aggregate_store::{AggregateStore, MergeOutcome};
use pipeline::queue::{mark_consumed, QueuedBatch};
use rollup_core::fold::fold_rows;
use rollup_core::{AggregateDefinition, Error, Result};
use telemetry::metrics;

/// Rollup worker configuration.
#[derive(Debug, Clone)]
pub struct RollupWorkerConfig {
    /// Non-blocking merge attempts before falling back to a blocking merge.
    pub max_merge_retries: u32,
    /// Backoff between merge attempts (scaled linearly per attempt).
    pub merge_backoff: Duration,
}

impl Default for RollupWorkerConfig {
    fn default() -> Self {
        Self {
            max_merge_retries: 3,
            merge_backoff: Duration::from_millis(10),
        }
    }
}

/// Worker that applies queued batches to one incremental aggregate.
pub struct RollupWorker {
    def: Arc<AggregateDefinition>,
    aggregates: Arc<AggregateStore>,
    rx: Receiver<QueuedBatch>,
    config: RollupWorkerConfig,
}

impl RollupWorker {
    pub fn new(
        def: Arc<AggregateDefinition>,
        aggregates: Arc<AggregateStore>,
        rx: Receiver<QueuedBatch>,
    ) -> Self {
        Self {
            def,
            aggregates,
            rx,
            config: RollupWorkerConfig::default(),
        }
    }

    pub fn with_config(
        def: Arc<AggregateDefinition>,
        aggregates: Arc<AggregateStore>,
        rx: Receiver<QueuedBatch>,
        config: RollupWorkerConfig,
    ) -> Self {
        Self {
            def,
            aggregates,
            rx,
            config,
        }
    }

    /// Main loop: consume the queue until it closes (engine shutdown).
    pub async fn run(mut self) {
        info!(
            definition = %self.def.name,
            stream = self.def.stream.as_str(),
            "Rollup worker starting"
        );

        while let Some(batch) = self.rx.recv().await {
            mark_consumed();
            if let Err(e) = self.apply(&batch).await {
                // Only wiring errors reach here; the aggregate itself is
                // untouched (merges are all-or-nothing).
                error!(
                    definition = %self.def.name,
                    batch_id = batch.batch_id,
                    error = %e,
                    "Failed to apply batch"
                );
            }
        }

        info!(definition = %self.def.name, "Rollup worker stopped");
    }

    /// Applies one durable batch: in-batch pre-aggregation, then a merge
    /// that advances the watermark. Idempotent per (definition, BatchId).
    pub async fn apply(&self, batch: &QueuedBatch) -> Result<()> {
        let start = Instant::now();
        let partials = fold_rows(&self.def, batch.rows.iter());

        let outcome = self.merge_with_retry(batch.batch_id, &partials).await?;

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics().rollup_apply_latency_ms.observe(latency_ms);

        match outcome {
            MergeOutcome::Applied { rows_touched } => {
                metrics().rollup_batches_applied.inc();
                metrics().rollup_rows_merged.inc_by(rows_touched as u64);
                info!(
                    definition = %self.def.name,
                    batch_id = batch.batch_id,
                    watermark = batch.batch_id,
                    rows_touched = rows_touched,
                    latency_ms = latency_ms,
                    "Rollup applied"
                );
            }
            MergeOutcome::AlreadyApplied => {
                metrics().rollup_replays_skipped.inc();
                debug!(
                    definition = %self.def.name,
                    batch_id = batch.batch_id,
                    "Batch at or below watermark, skipping"
                );
            }
        }
        Ok(())
    }

    /// Bounded-backoff merge. Contention is retried non-blocking; once the
    /// retry budget is spent we take the blocking path so `MergeConflict`
    /// never escapes the worker.
    async fn merge_with_retry(
        &self,
        batch_id: u64,
        partials: &rollup_core::fold::PartialRows,
    ) -> Result<MergeOutcome> {
        for attempt in 0..self.config.max_merge_retries {
            match self.aggregates.try_merge_batch(&self.def, batch_id, partials) {
                Ok(outcome) => return Ok(outcome),
                Err(Error::MergeConflict { .. }) => {
                    metrics().merge_conflicts.inc();
                    let backoff = self.config.merge_backoff * (attempt + 1);
                    debug!(
                        definition = %self.def.name,
                        attempt = attempt + 1,
                        backoff_ms = %backoff.as_millis(),
                        "Merge contention, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.aggregates.merge_batch(&self.def, batch_id, partials)
    }
}
