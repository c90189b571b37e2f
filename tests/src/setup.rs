//! Common test setup functions.

use std::sync::Arc;
use std::time::Duration;

use aggregate_store::{AggregateStore, MemoryBaseStore};
use pipeline::{IngestionSink, RollupQueues};
use rollup_core::{AggregateDefinition, AggregateRegistry, BatchId};
use worker::{WorkerConfig, WorkerScheduler};

/// Test context wiring the whole engine with production code paths:
/// real sink, real bounded queues, real workers, in-process stores.
pub struct TestContext {
    pub registry: Arc<AggregateRegistry>,
    pub base: Arc<MemoryBaseStore>,
    pub aggregates: Arc<AggregateStore>,
    pub queues: Arc<RollupQueues>,
    pub sink: IngestionSink,
}

impl TestContext {
    /// Context with the built-in registry and a roomy queue.
    pub fn new() -> Self {
        Self::with_queue_depth(64)
    }

    pub fn with_queue_depth(depth: usize) -> Self {
        let registry = Arc::new(AggregateRegistry::builtin().expect("builtin registry"));
        Self::build(registry, depth)
    }

    pub fn with_definitions(definitions: Vec<AggregateDefinition>) -> Self {
        let registry =
            Arc::new(AggregateRegistry::new(definitions).expect("test registry"));
        Self::build(registry, 64)
    }

    fn build(registry: Arc<AggregateRegistry>, depth: usize) -> Self {
        let base = Arc::new(MemoryBaseStore::new());
        let aggregates = Arc::new(AggregateStore::new(&registry));
        let queues = Arc::new(RollupQueues::new(&registry, depth));
        let sink = IngestionSink::new(registry.clone(), base.clone(), queues.clone());
        Self {
            registry,
            base,
            aggregates,
            queues,
            sink,
        }
    }

    /// Starts the background workers (rollup, recompute, retention). The
    /// retention interval is pushed out so passes only happen when a test
    /// drives them explicitly.
    pub fn start_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let config = WorkerConfig {
            retention_interval: Duration::from_secs(3600),
            metrics_flush_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let scheduler = Arc::new(WorkerScheduler::new(
            config,
            self.registry.clone(),
            self.base.clone(),
            self.aggregates.clone(),
            self.queues.clone(),
        ));
        scheduler.start()
    }

    /// Polls until the definition's watermark reaches `batch_id`.
    pub async fn wait_for_watermark(&self, definition: &str, batch_id: BatchId) {
        for _ in 0..500 {
            if let Ok(Some(watermark)) = self.aggregates.watermark(definition) {
                if watermark >= batch_id {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "watermark for '{}' never reached batch {}",
            definition, batch_id
        );
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
