//! Read-consistent snapshots over base partitions.
//!
//! A snapshot holds `Arc` references to the partitions it was taken from,
//! so concurrent appends and partition drops never change what it reads.
//! While alive it pins its partitions against in-place rewrites
//! (downsampling); the pin is released on drop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use rollup_core::{PartitionId, StoredRow, StreamKind};

use crate::base::{Partition, StreamState};

/// Releases per-partition pins when the snapshot goes away.
pub(crate) struct SnapshotGuard {
    state: Arc<Mutex<StreamState>>,
    ids: Vec<PartitionId>,
}

impl SnapshotGuard {
    pub(crate) fn new(state: Arc<Mutex<StreamState>>, ids: Vec<PartitionId>) -> Self {
        Self { state, ids }
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for id in &self.ids {
            if let Some(count) = state.pins.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    state.pins.remove(id);
                }
            }
        }
    }
}

/// A fixed view of one stream's partitions for a single recompute cycle.
pub struct Snapshot {
    stream: StreamKind,
    parts: Vec<Arc<Partition>>,
    taken_at: DateTime<Utc>,
    _guard: SnapshotGuard,
}

impl Snapshot {
    pub(crate) fn new(
        stream: StreamKind,
        parts: Vec<Arc<Partition>>,
        taken_at: DateTime<Utc>,
        guard: SnapshotGuard,
    ) -> Self {
        Self {
            stream,
            parts,
            taken_at,
            _guard: guard,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.parts
    }

    /// All rows across the snapshot's partitions, unordered.
    pub fn rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.parts.iter().flat_map(|p| p.rows.iter())
    }

    pub fn row_count(&self) -> usize {
        self.parts.iter().map(|p| p.rows.len()).sum()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("stream", &self.stream)
            .field("partitions", &self.parts.len())
            .field("rows", &self.row_count())
            .field("taken_at", &self.taken_at)
            .finish()
    }
}
