//! Internal telemetry for the rollup engine.
//!
//! In-process counters and histograms rather than an external metrics
//! system; the observability collaborators consume snapshots and the
//! structured log stream.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
