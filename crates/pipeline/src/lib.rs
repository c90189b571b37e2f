//! Ingestion sink and bounded rollup queues.
//!
//! The sink is the single entry point for new data. Acknowledgment is
//! decoupled from rollup application: `ingest` returns once the batch is
//! durable in the base store and enqueued for every incremental aggregate
//! on the stream; per-definition workers apply the batches asynchronously.

pub mod queue;
pub mod sink;

pub use queue::{QueuedBatch, RollupQueues};
pub use sink::IngestionSink;
