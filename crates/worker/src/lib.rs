//! Background workers for the rollup engine.
//!
//! Handles the async half of the pipeline:
//! - Rollup (per-definition queue -> aggregate store merges)
//! - Recompute (scheduled full re-derivation with atomic swap)
//! - Retention (partition-granular downsample/delete)

pub mod recompute;
pub mod retention;
pub mod rollup;
pub mod scheduler;

pub use recompute::{CycleOutcome, RecomputeEngine};
pub use retention::{RetentionConfig, RetentionWorker};
pub use rollup::{RollupWorker, RollupWorkerConfig};
pub use scheduler::{WorkerConfig, WorkerScheduler};
