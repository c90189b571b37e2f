//! Ingestion sink: the single entry point for new data.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use aggregate_store::BaseStore;
use rollup_core::{schema, AggregateRegistry, BatchId, Record, Result, StreamKind};
use telemetry::metrics;

use crate::queue::{send_reserved, QueuedBatch, RollupQueues};

/// Accepts batches of immutable records, validates them wholesale, appends
/// them durably, and fans them out to every incremental definition's queue.
pub struct IngestionSink {
    registry: Arc<AggregateRegistry>,
    base: Arc<dyn BaseStore>,
    queues: Arc<RollupQueues>,
    /// Serializes append+enqueue per stream so queue order always matches
    /// BatchId order (the watermark treats out-of-order batches as
    /// replays).
    stream_locks: [tokio::sync::Mutex<()>; 2],
}

impl IngestionSink {
    pub fn new(
        registry: Arc<AggregateRegistry>,
        base: Arc<dyn BaseStore>,
        queues: Arc<RollupQueues>,
    ) -> Self {
        Self {
            registry,
            base,
            queues,
            stream_locks: [tokio::sync::Mutex::new(()), tokio::sync::Mutex::new(())],
        }
    }

    fn stream_lock(&self, stream: StreamKind) -> &tokio::sync::Mutex<()> {
        match stream {
            StreamKind::Events => &self.stream_locks[0],
            StreamKind::Orders => &self.stream_locks[1],
        }
    }

    /// Ingests one batch. All-or-nothing: validation failure or backpressure
    /// rejects the batch with no side effects. On success the batch is
    /// durable and enqueued; rollup application happens asynchronously.
    pub async fn ingest(&self, stream: StreamKind, records: Vec<Record>) -> Result<BatchId> {
        let start = Instant::now();
        let ingest_id = Uuid::new_v4();
        metrics().batches_ingested.inc();

        debug!(
            ingest_id = %ingest_id,
            stream = stream.as_str(),
            records = records.len(),
            "Received batch"
        );

        if let Err(e) = schema::validate_batch(stream, &records) {
            metrics().batches_rejected.inc();
            warn!(ingest_id = %ingest_id, error = %e, "Batch rejected");
            return Err(e);
        }

        let _ordering = self.stream_lock(stream).lock().await;

        // Reserve queue slots before the durable append so a backpressure
        // rejection leaves no trace in the base store.
        let defs = self.registry.incremental_for(stream);
        let permits = match self.queues.try_reserve_for(&defs) {
            Ok(permits) => {
                metrics().backpressure_active.set(0);
                permits
            }
            Err(e) => {
                metrics().overload_rejections.inc();
                metrics().backpressure_active.set(1);
                warn!(ingest_id = %ingest_id, error = %e, "Backpressure rejection");
                return Err(e);
            }
        };

        let record_count = records.len();
        let rows = Arc::new(
            records
                .into_iter()
                .map(Record::into_stored)
                .collect::<Vec<_>>(),
        );

        let batch_id = self.base.append(stream, rows.as_ref().clone()).await?;

        for permit in permits {
            send_reserved(
                permit,
                QueuedBatch {
                    stream,
                    batch_id,
                    rows: rows.clone(),
                },
            );
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics().records_ingested.inc_by(record_count as u64);
        metrics().ingest_latency_ms.observe(latency_ms);

        info!(
            stream = stream.as_str(),
            batch_id = batch_id,
            records = record_count,
            definitions = defs.len(),
            latency_ms = latency_ms,
            "Batch ingested"
        );

        Ok(batch_id)
    }
}
