//! Base store: durable, append-only, partition-granular.
//!
//! The trait is the interface the engine requires of the external storage
//! engine; `MemoryBaseStore` is the in-process implementation the workers
//! and tests run against. Partitions are monthly (`YYYYMM`). Retention and
//! recompute coordinate through per-partition snapshot pins: rewrites
//! (downsampling) refuse pinned partitions, drops always proceed because
//! snapshots hold copy-on-write references.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use rollup_core::{BatchId, Error, PartitionId, Result, StoredRow, StreamKind};

use crate::snapshot::{Snapshot, SnapshotGuard};

/// One partition's rows. Immutable once wrapped in `Arc`; mutation goes
/// through `Arc::make_mut`, which is what makes snapshots copy-on-write.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: PartitionId,
    pub rows: Vec<StoredRow>,
    /// Set once the partition's raw rows were replaced by summaries.
    pub downsampled: bool,
}

/// Partition metadata for retention scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMeta {
    pub id: PartitionId,
    pub rows: u64,
    pub downsampled: bool,
}

/// Interface to the storage engine holding base records.
#[async_trait]
pub trait BaseStore: Send + Sync {
    /// Durably appends a batch, assigning the next per-stream BatchId.
    async fn append(&self, stream: StreamKind, rows: Vec<StoredRow>) -> Result<BatchId>;

    /// Takes a read-consistent snapshot of the stream's partitions. With
    /// `not_before`, partitions entirely older than that instant are left
    /// out (partition-granular pruning; row-level windowing is the
    /// caller's).
    async fn snapshot(
        &self,
        stream: StreamKind,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Snapshot>;

    async fn partitions(&self, stream: StreamKind) -> Result<Vec<PartitionMeta>>;

    /// Reads one partition's rows without pinning it (retention uses this to
    /// build replacement summaries).
    async fn partition_rows(&self, stream: StreamKind, id: PartitionId) -> Result<Vec<StoredRow>>;

    /// Drops a whole partition. Returns the number of rows removed. Always
    /// proceeds; live snapshots keep their copy-on-write reference.
    async fn drop_partition(&self, stream: StreamKind, id: PartitionId) -> Result<u64>;

    /// Replaces a partition's rows with downsampled summaries. Fails with
    /// `RetentionRace` while any snapshot pins the partition. Returns
    /// `(rows_removed, rows_written)`.
    async fn replace_partition(
        &self,
        stream: StreamKind,
        id: PartitionId,
        rows: Vec<StoredRow>,
    ) -> Result<(u64, u64)>;

    /// Primary-key scan over `[from, to)`, ordered by `(timestamp, id)`.
    async fn scan_range(
        &self,
        stream: StreamKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRow>>;

    /// Alternate-sort-key scan: one user's rows in time order.
    async fn scan_by_user(
        &self,
        stream: StreamKind,
        user_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredRow>>;
}

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub(crate) partitions: BTreeMap<PartitionId, Arc<Partition>>,
    pub(crate) next_batch_id: BatchId,
    /// Live snapshot pins per partition.
    pub(crate) pins: HashMap<PartitionId, usize>,
}

/// In-process base store.
#[derive(Debug, Default)]
pub struct MemoryBaseStore {
    events: Arc<Mutex<StreamState>>,
    orders: Arc<Mutex<StreamState>>,
}

impl MemoryBaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_state(&self, stream: StreamKind) -> &Arc<Mutex<StreamState>> {
        match stream {
            StreamKind::Events => &self.events,
            StreamKind::Orders => &self.orders,
        }
    }
}

#[async_trait]
impl BaseStore for MemoryBaseStore {
    async fn append(&self, stream: StreamKind, rows: Vec<StoredRow>) -> Result<BatchId> {
        if let Some(row) = rows.iter().find(|r| r.stream() != stream) {
            return Err(Error::store(format!(
                "{} row appended to {} stream",
                row.stream().as_str(),
                stream.as_str()
            )));
        }

        let mut state = self.stream_state(stream).lock();
        let batch_id = state.next_batch_id;
        state.next_batch_id += 1;

        for row in rows {
            let id = row.partition();
            let partition = state
                .partitions
                .entry(id)
                .or_insert_with(|| {
                    Arc::new(Partition {
                        id,
                        rows: Vec::new(),
                        downsampled: false,
                    })
                });
            Arc::make_mut(partition).rows.push(row);
        }
        Ok(batch_id)
    }

    async fn snapshot(
        &self,
        stream: StreamKind,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Snapshot> {
        let cutoff = not_before.map(PartitionId::of);
        let state_arc = self.stream_state(stream).clone();
        let mut state = state_arc.lock();

        let parts: Vec<Arc<Partition>> = state
            .partitions
            .iter()
            .filter(|(id, _)| cutoff.map_or(true, |c| **id >= c))
            .map(|(_, p)| p.clone())
            .collect();

        let ids: Vec<PartitionId> = parts.iter().map(|p| p.id).collect();
        for id in &ids {
            *state.pins.entry(*id).or_insert(0) += 1;
        }
        drop(state);

        Ok(Snapshot::new(
            stream,
            parts,
            Utc::now(),
            SnapshotGuard::new(state_arc, ids),
        ))
    }

    async fn partitions(&self, stream: StreamKind) -> Result<Vec<PartitionMeta>> {
        let state = self.stream_state(stream).lock();
        Ok(state
            .partitions
            .values()
            .map(|p| PartitionMeta {
                id: p.id,
                rows: p.rows.len() as u64,
                downsampled: p.downsampled,
            })
            .collect())
    }

    async fn partition_rows(&self, stream: StreamKind, id: PartitionId) -> Result<Vec<StoredRow>> {
        let state = self.stream_state(stream).lock();
        match state.partitions.get(&id) {
            Some(partition) => Ok(partition.rows.clone()),
            None => Err(Error::store(format!(
                "partition {} not found in {}",
                id,
                stream.as_str()
            ))),
        }
    }

    async fn drop_partition(&self, stream: StreamKind, id: PartitionId) -> Result<u64> {
        let mut state = self.stream_state(stream).lock();
        match state.partitions.remove(&id) {
            Some(partition) => Ok(partition.rows.len() as u64),
            None => Err(Error::store(format!(
                "partition {} not found in {}",
                id,
                stream.as_str()
            ))),
        }
    }

    async fn replace_partition(
        &self,
        stream: StreamKind,
        id: PartitionId,
        rows: Vec<StoredRow>,
    ) -> Result<(u64, u64)> {
        let mut state = self.stream_state(stream).lock();

        if state.pins.get(&id).copied().unwrap_or(0) > 0 {
            return Err(Error::retention_race(stream.as_str(), id));
        }

        let removed = match state.partitions.get(&id) {
            Some(partition) => partition.rows.len() as u64,
            None => {
                return Err(Error::store(format!(
                    "partition {} not found in {}",
                    id,
                    stream.as_str()
                )))
            }
        };

        let written = rows.len() as u64;
        state.partitions.insert(
            id,
            Arc::new(Partition {
                id,
                rows,
                downsampled: true,
            }),
        );
        Ok((removed, written))
    }

    async fn scan_range(
        &self,
        stream: StreamKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        let (from_part, to_part) = (PartitionId::of(from), PartitionId::of(to));
        let state = self.stream_state(stream).lock();

        let mut rows: Vec<StoredRow> = state
            .partitions
            .range(from_part..=to_part)
            .flat_map(|(_, p)| p.rows.iter())
            .filter(|r| {
                let ts = r.timestamp();
                ts >= from && ts < to
            })
            .cloned()
            .collect();
        drop(state);

        rows.sort_by_key(|r| r.sort_key());
        rows.truncate(limit);
        Ok(rows)
    }

    async fn scan_by_user(
        &self,
        stream: StreamKind,
        user_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        let state = self.stream_state(stream).lock();
        let mut rows: Vec<StoredRow> = state
            .partitions
            .values()
            .flat_map(|p| p.rows.iter())
            .filter(|r| r.user_id() == Some(user_id))
            .cloned()
            .collect();
        drop(state);

        rows.sort_by_key(|r| r.sort_key());
        rows.truncate(limit);
        Ok(rows)
    }
}
