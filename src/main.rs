//! Rollup Engine
//!
//! Incremental rollup and lifecycle engine for append-only analytics
//! streams:
//! - batch ingestion with wholesale validation and queue backpressure
//! - per-definition incremental rollup with idempotent watermarks
//! - scheduled recompute with atomic result swaps
//! - partition-granular retention (downsample-then-delete or delete)

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use aggregate_store::{AggregateStore, MemoryBaseStore};
use pipeline::{IngestionSink, RollupQueues};
use rollup_core::{AggregateDefinition, AggregateRegistry};
use telemetry::{health, init_tracing_from_env};
use worker::{RetentionConfig, WorkerConfig, WorkerScheduler};

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    /// Rollup queue depth per definition (backpressure threshold)
    #[serde(default = "default_queue_depth")]
    queue_depth: usize,

    /// Retention check interval in seconds
    #[serde(default = "default_retention_interval_secs")]
    retention_interval_secs: u64,

    /// Metrics flush interval in seconds
    #[serde(default = "default_metrics_flush_secs")]
    metrics_flush_secs: u64,

    /// Per-stream retention policies
    #[serde(default)]
    retention: RetentionSettings,

    /// Aggregate definitions; empty means the built-in set
    #[serde(default)]
    aggregates: Vec<AggregateDefinition>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RetentionSettings {
    events: rollup_core::RetentionPolicy,
    orders: rollup_core::RetentionPolicy,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        let defaults = RetentionConfig::default();
        Self {
            events: defaults.events,
            orders: defaults.orders,
        }
    }
}

fn default_queue_depth() -> usize {
    256
}

fn default_retention_interval_secs() -> u64 {
    3600
}

fn default_metrics_flush_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            retention_interval_secs: default_retention_interval_secs(),
            metrics_flush_secs: default_metrics_flush_secs(),
            retention: RetentionSettings::default(),
            aggregates: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing_from_env();

    info!("Starting Rollup Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;

    // Build the aggregate registry: static, validated once, shared by Arc.
    let registry = if config.aggregates.is_empty() {
        AggregateRegistry::builtin().context("Invalid built-in aggregate definitions")?
    } else {
        AggregateRegistry::new(config.aggregates.clone())
            .context("Invalid aggregate definitions in configuration")?
    };

    let retention = RetentionConfig {
        events: config.retention.events,
        orders: config.retention.orders,
    };
    retention
        .validate()
        .context("Invalid retention configuration")?;

    // A scheduled recompute must never scan past what retention keeps.
    registry
        .check_scan_windows(|stream| Some(retention.max_age_hours(stream)))
        .context("Aggregate scan windows conflict with retention")?;

    let registry = Arc::new(registry);
    info!(
        definitions = registry.len(),
        scheduled = registry.scheduled().len(),
        queue_depth = config.queue_depth,
        "Aggregate registry loaded"
    );

    // Wire stores, queues, and the sink.
    let base = Arc::new(MemoryBaseStore::new());
    let aggregates = Arc::new(AggregateStore::new(&registry));
    let queues = Arc::new(RollupQueues::new(&registry, config.queue_depth));
    // The sink is the ingress handle an embedding front end drives; this
    // binary only runs the lifecycle workers.
    let _sink = IngestionSink::new(registry.clone(), base.clone(), queues.clone());

    health().store.set_healthy();
    health().pipeline.set_healthy();
    info!(status = ?health().report().status, "Component health");

    // Start background workers.
    let worker_config = WorkerConfig {
        retention_interval: std::time::Duration::from_secs(config.retention_interval_secs),
        metrics_flush_interval: std::time::Duration::from_secs(config.metrics_flush_secs),
        rollup: Default::default(),
        retention,
    };
    let scheduler = Arc::new(WorkerScheduler::new(
        worker_config,
        registry.clone(),
        base,
        aggregates,
        queues,
    ));
    let worker_handles = scheduler.start();

    info!("Rollup engine running; press Ctrl+C to stop");
    shutdown_signal().await;

    info!("Shutting down...");
    for handle in worker_handles {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("ROLLUP")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Manual overrides for the flat knobs; the config crate's nested env
    // parsing is unreliable with underscored field names.
    if let Ok(depth) = std::env::var("ROLLUP_QUEUE_DEPTH") {
        config.queue_depth = depth
            .parse()
            .context("ROLLUP_QUEUE_DEPTH must be an integer")?;
    }
    if let Ok(secs) = std::env::var("ROLLUP_RETENTION_INTERVAL_SECS") {
        config.retention_interval_secs = secs
            .parse()
            .context("ROLLUP_RETENTION_INTERVAL_SECS must be an integer")?;
    }

    Ok(config)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
