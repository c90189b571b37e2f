//! Worker scheduler for background tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use aggregate_store::{AggregateStore, BaseStore};
use pipeline::RollupQueues;
use rollup_core::AggregateRegistry;
use telemetry::metrics;

use crate::recompute::RecomputeEngine;
use crate::retention::{RetentionConfig, RetentionWorker};
use crate::rollup::{RollupWorker, RollupWorkerConfig};

/// Worker scheduler configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retention check interval
    pub retention_interval: Duration,
    /// Metrics flush interval
    pub metrics_flush_interval: Duration,
    /// Per-definition rollup worker tuning
    pub rollup: RollupWorkerConfig,
    /// Per-stream retention policies
    pub retention: RetentionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retention_interval: Duration::from_secs(3600), // 1 hour
            metrics_flush_interval: Duration::from_secs(60), // 1 minute
            rollup: RollupWorkerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Background worker scheduler.
///
/// Spawns one rollup worker per incremental definition, one recompute
/// ticker per scheduled definition, the retention ticker, and the metrics
/// flush loop.
pub struct WorkerScheduler {
    config: WorkerConfig,
    registry: Arc<AggregateRegistry>,
    base: Arc<dyn BaseStore>,
    aggregates: Arc<AggregateStore>,
    queues: Arc<RollupQueues>,
}

impl WorkerScheduler {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<AggregateRegistry>,
        base: Arc<dyn BaseStore>,
        aggregates: Arc<AggregateStore>,
        queues: Arc<RollupQueues>,
    ) -> Self {
        Self {
            config,
            registry,
            base,
            aggregates,
            queues,
        }
    }

    /// Starts all background workers.
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        // Rollup workers, one per incremental definition.
        for def in self.registry.all().iter().filter(|d| d.is_incremental()) {
            let Some(rx) = self.queues.take_receiver(&def.name) else {
                error!(definition = %def.name, "Rollup queue receiver already taken");
                continue;
            };
            let worker = RollupWorker::with_config(
                def.clone(),
                self.aggregates.clone(),
                rx,
                self.config.rollup.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }
        info!(
            workers = handles.len(),
            "Rollup workers started"
        );

        // Recompute tickers, one per scheduled definition.
        let engine = Arc::new(RecomputeEngine::new(
            self.base.clone(),
            self.aggregates.clone(),
        ));
        for def in self.registry.scheduled() {
            let engine = engine.clone();
            let spec_interval = def
                .scheduled_spec()
                .map(|s| s.refresh_interval())
                .unwrap_or(Duration::from_secs(60));
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(spec_interval);
                loop {
                    ticker.tick().await;
                    // Timeouts and skips are reported inside the engine; a
                    // wiring error here is worth a log line but not a crash.
                    if let Err(e) = engine.recompute(&def).await {
                        if !matches!(e, rollup_core::Error::RecomputeTimeout { .. }) {
                            error!(definition = %def.name, error = %e, "Recompute cycle error");
                        }
                    }
                }
            }));
        }

        // Retention worker.
        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_retention_worker().await;
        }));

        // Metrics flush worker.
        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_metrics_flush().await;
        }));

        info!("Background workers started");
        handles
    }

    async fn run_retention_worker(&self) {
        let worker = RetentionWorker::new(
            self.base.clone(),
            self.aggregates.clone(),
            self.registry.clone(),
            self.config.retention.clone(),
        );
        let mut ticker = interval(self.config.retention_interval);

        loop {
            ticker.tick().await;

            if let Err(e) = worker.run().await {
                error!("Retention worker error: {}", e);
            }
        }
    }

    async fn run_metrics_flush(&self) {
        let mut ticker = interval(self.config.metrics_flush_interval);

        loop {
            ticker.tick().await;

            let snapshot = metrics().snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!(target: "metrics", snapshot = %json, "Metrics snapshot"),
                Err(e) => error!("Failed to serialize metrics snapshot: {}", e),
            }
        }
    }
}
