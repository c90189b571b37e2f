//! Base-data and aggregate stores for the rollup engine.
//!
//! The base store is the seam to the external storage engine: a trait plus
//! an in-process, partition-granular reference implementation. The aggregate
//! store holds materialized rollup results and is read-only from the
//! outside.

pub mod aggregate;
pub mod base;
pub mod snapshot;

pub use aggregate::{AggregateRow, AggregateStore, FinalizedRow, MergeOutcome, ResultSet};
pub use base::{BaseStore, MemoryBaseStore, Partition, PartitionMeta};
pub use snapshot::Snapshot;
