//! Bounded per-definition batch queues.
//!
//! One queue per incremental definition keeps batches in BatchId order per
//! definition while letting definitions apply the same batch independently.
//! Queue depth is the engine's backpressure signal: enqueueing is
//! all-or-nothing across a stream's definitions, reserved before the batch
//! is made durable, so a rejected batch leaves no trace anywhere.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError, Permit, Receiver, Sender};

use rollup_core::{AggregateDefinition, AggregateRegistry, BatchId, Error, Result, StoredRow, StreamKind};
use telemetry::metrics;

/// A durable batch queued for one incremental definition.
///
/// Rows are shared across a stream's queues, not copied per definition.
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub stream: StreamKind,
    pub batch_id: BatchId,
    pub rows: Arc<Vec<StoredRow>>,
}

/// The set of rollup queues, one per incremental definition.
pub struct RollupQueues {
    senders: HashMap<String, Sender<QueuedBatch>>,
    receivers: Mutex<HashMap<String, Receiver<QueuedBatch>>>,
    depth: usize,
}

impl RollupQueues {
    /// Builds a bounded queue for every incremental definition in the
    /// registry.
    pub fn new(registry: &AggregateRegistry, depth: usize) -> Self {
        let depth = depth.max(1);
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for def in registry.all().iter().filter(|d| d.is_incremental()) {
            let (tx, rx) = mpsc::channel(depth);
            senders.insert(def.name.clone(), tx);
            receivers.insert(def.name.clone(), rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Reserves one slot in every given definition's queue, or fails with
    /// `Overloaded` without reserving anything.
    pub fn try_reserve_for(
        &self,
        defs: &[Arc<AggregateDefinition>],
    ) -> Result<Vec<Permit<'_, QueuedBatch>>> {
        let mut permits = Vec::with_capacity(defs.len());
        for def in defs {
            let sender = self
                .senders
                .get(&def.name)
                .ok_or_else(|| Error::UnknownDefinition(def.name.clone()))?;
            match sender.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(TrySendError::Full(())) => {
                    // Unreserved permits are released as `permits` drops.
                    return Err(Error::overloaded(format!(
                        "rollup queue for '{}' is at capacity {}",
                        def.name, self.depth
                    )));
                }
                Err(TrySendError::Closed(())) => {
                    return Err(Error::internal(format!(
                        "rollup queue for '{}' is closed",
                        def.name
                    )));
                }
            }
        }
        Ok(permits)
    }

    /// Hands a definition's receiver to its rollup worker. Each receiver can
    /// be taken once.
    pub fn take_receiver(&self, name: &str) -> Option<Receiver<QueuedBatch>> {
        self.receivers.lock().remove(name)
    }
}

/// Sends a batch through a reserved permit, keeping the depth gauge current.
pub fn send_reserved(permit: Permit<'_, QueuedBatch>, batch: QueuedBatch) {
    permit.send(batch);
    metrics().rollup_queue_depth.inc();
}

/// Marks a batch consumed from a queue.
pub fn mark_consumed() {
    metrics().rollup_queue_depth.dec();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AggregateRegistry {
        AggregateRegistry::builtin().unwrap()
    }

    #[tokio::test]
    async fn reserve_is_all_or_nothing() {
        let registry = registry();
        let queues = RollupQueues::new(&registry, 1);
        let defs = registry.incremental_for(StreamKind::Events);

        // First reservation fills every queue's single slot.
        let permits = queues.try_reserve_for(&defs).unwrap();
        assert_eq!(permits.len(), defs.len());
        for permit in permits {
            send_reserved(
                permit,
                QueuedBatch {
                    stream: StreamKind::Events,
                    batch_id: 0,
                    rows: Arc::new(Vec::new()),
                },
            );
        }

        // Second reservation must fail without consuming capacity anywhere.
        let err = queues.try_reserve_for(&defs).unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));

        // Draining one definition's queue frees it again.
        let mut rx = queues.take_receiver(&defs[0].name).unwrap();
        for def in &defs[1..] {
            let _ = queues.take_receiver(&def.name).unwrap();
        }
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn receiver_can_be_taken_once() {
        let registry = registry();
        let queues = RollupQueues::new(&registry, 4);
        assert!(queues.take_receiver("event_type_totals").is_some());
        assert!(queues.take_receiver("event_type_totals").is_none());
        assert!(queues.take_receiver("no_such_definition").is_none());
    }
}
