//! Aggregate store: materialized rollup results.
//!
//! Incremental rows are mutated in place under a per-definition mutex, with
//! the watermark advanced in the same critical section as the merge, so a
//! replayed batch at or below the watermark is a clean no-op. Scheduled
//! result sets are published behind an `Arc` pointer swap, so readers see
//! either the previous complete result or the next, never a staging state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use rollup_core::fold::PartialRows;
use rollup_core::{
    AggregateDefinition, AggregateRegistry, BatchId, Error, GroupTuple, GroupValue,
    MeasureValue, Result,
};

/// One stored aggregate row: the grouping tuple plus its merged measure
/// values, index-aligned with the definition's measures.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub group: GroupTuple,
    pub values: Vec<MeasureValue>,
}

/// A read-time finalized row. Finalization never mutates stored state.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedRow {
    pub group: GroupTuple,
    pub measures: Vec<(String, f64)>,
}

impl FinalizedRow {
    pub fn value(&self, measure: &str) -> Option<f64> {
        self.measures
            .iter()
            .find(|(name, _)| name == measure)
            .map(|(_, v)| *v)
    }
}

/// A complete published result of one scheduled recompute cycle.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub rows: Vec<AggregateRow>,
    /// `None` until the first recompute publishes.
    pub computed_at: Option<DateTime<Utc>>,
}

/// Outcome of merging one batch into an incremental aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied { rows_touched: usize },
    /// Batch at or below the watermark: already fully merged.
    AlreadyApplied,
}

#[derive(Debug, Default)]
struct IncrementalState {
    rows: HashMap<GroupTuple, Vec<MeasureValue>>,
    watermark: Option<BatchId>,
}

struct ScheduledSlot {
    published: RwLock<Arc<ResultSet>>,
    in_flight: AtomicBool,
}

/// Process-wide store of materialized aggregates.
pub struct AggregateStore {
    incremental: HashMap<String, Mutex<IncrementalState>>,
    scheduled: HashMap<String, ScheduledSlot>,
}

impl AggregateStore {
    pub fn new(registry: &AggregateRegistry) -> Self {
        let mut incremental = HashMap::new();
        let mut scheduled = HashMap::new();
        for def in registry.all() {
            if def.is_incremental() {
                incremental.insert(def.name.clone(), Mutex::new(IncrementalState::default()));
            } else {
                scheduled.insert(
                    def.name.clone(),
                    ScheduledSlot {
                        published: RwLock::new(Arc::new(ResultSet::default())),
                        in_flight: AtomicBool::new(false),
                    },
                );
            }
        }
        Self {
            incremental,
            scheduled,
        }
    }

    fn incremental_state(&self, name: &str) -> Result<&Mutex<IncrementalState>> {
        self.incremental
            .get(name)
            .ok_or_else(|| Error::UnknownDefinition(name.to_string()))
    }

    fn scheduled_slot(&self, name: &str) -> Result<&ScheduledSlot> {
        self.scheduled
            .get(name)
            .ok_or_else(|| Error::UnknownDefinition(name.to_string()))
    }

    // === Incremental path ===

    /// Non-blocking merge attempt. Contention surfaces as `MergeConflict`
    /// for the caller's bounded-backoff retry loop.
    pub fn try_merge_batch(
        &self,
        def: &AggregateDefinition,
        batch_id: BatchId,
        partials: &PartialRows,
    ) -> Result<MergeOutcome> {
        let mutex = self.incremental_state(&def.name)?;
        match mutex.try_lock() {
            Some(mut state) => merge_locked(&mut state, def, batch_id, partials),
            None => Err(Error::merge_conflict(&def.name)),
        }
    }

    /// Blocking merge, used once the retry budget is spent.
    pub fn merge_batch(
        &self,
        def: &AggregateDefinition,
        batch_id: BatchId,
        partials: &PartialRows,
    ) -> Result<MergeOutcome> {
        let mut state = self.incremental_state(&def.name)?.lock();
        merge_locked(&mut state, def, batch_id, partials)
    }

    /// Highest fully merged BatchId for a definition.
    pub fn watermark(&self, name: &str) -> Result<Option<BatchId>> {
        Ok(self.incremental_state(name)?.lock().watermark)
    }

    /// All incremental rows, finalized, ordered by grouping tuple.
    pub fn incremental_rows(&self, def: &AggregateDefinition) -> Result<Vec<FinalizedRow>> {
        let state = self.incremental_state(&def.name)?.lock();
        let mut rows: Vec<FinalizedRow> = state
            .rows
            .iter()
            .map(|(group, values)| finalize(def, group, values))
            .collect();
        drop(state);
        rows.sort_by(|a, b| a.group.cmp(&b.group));
        Ok(rows)
    }

    /// One incremental row by grouping tuple.
    pub fn incremental_row(
        &self,
        def: &AggregateDefinition,
        group: &GroupTuple,
    ) -> Result<Option<FinalizedRow>> {
        let state = self.incremental_state(&def.name)?.lock();
        Ok(state.rows.get(group).map(|values| finalize(def, group, values)))
    }

    /// Drops rows whose leading time bucket is older than the cutoff.
    /// Returns the number of rows pruned.
    pub fn prune_rows_before(
        &self,
        def: &AggregateDefinition,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.incremental_state(&def.name)?.lock();
        let before = state.rows.len();
        state.rows.retain(|group, _| {
            !matches!(group.0.first(), Some(GroupValue::Time(t)) if *t < cutoff)
        });
        Ok((before - state.rows.len()) as u64)
    }

    // === Scheduled path ===

    /// Marks a recompute in flight. Returns false if one is already running
    /// (the caller skips, not queues).
    pub fn begin_recompute(&self, name: &str) -> Result<bool> {
        let slot = self.scheduled_slot(name)?;
        Ok(slot
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    pub fn finish_recompute(&self, name: &str) -> Result<()> {
        self.scheduled_slot(name)?
            .in_flight
            .store(false, Ordering::Release);
        Ok(())
    }

    /// Atomically publishes a complete recompute result.
    pub fn publish(
        &self,
        def: &AggregateDefinition,
        rows: Vec<AggregateRow>,
        computed_at: DateTime<Utc>,
    ) -> Result<()> {
        let slot = self.scheduled_slot(&def.name)?;
        *slot.published.write() = Arc::new(ResultSet {
            rows,
            computed_at: Some(computed_at),
        });
        Ok(())
    }

    /// The currently published result set.
    pub fn published(&self, name: &str) -> Result<Arc<ResultSet>> {
        Ok(self.scheduled_slot(name)?.published.read().clone())
    }

    /// The currently published result set, finalized in published order.
    pub fn published_rows(&self, def: &AggregateDefinition) -> Result<Vec<FinalizedRow>> {
        let result = self.published(&def.name)?;
        Ok(result
            .rows
            .iter()
            .map(|row| finalize(def, &row.group, &row.values))
            .collect())
    }
}

fn finalize(
    def: &AggregateDefinition,
    group: &GroupTuple,
    values: &[MeasureValue],
) -> FinalizedRow {
    FinalizedRow {
        group: group.clone(),
        measures: def
            .measures
            .iter()
            .zip(values.iter())
            .map(|(m, v)| (m.name.clone(), v.finalize()))
            .collect(),
    }
}

/// Merge under the definition lock. All-or-nothing: the merged values are
/// staged first, then committed together with the watermark, so a crash or
/// error can never leave a half-merged batch behind a stale watermark.
fn merge_locked(
    state: &mut IncrementalState,
    def: &AggregateDefinition,
    batch_id: BatchId,
    partials: &PartialRows,
) -> Result<MergeOutcome> {
    if let Some(watermark) = state.watermark {
        if batch_id <= watermark {
            return Ok(MergeOutcome::AlreadyApplied);
        }
    }

    let mut staged: Vec<(GroupTuple, Vec<MeasureValue>)> = Vec::with_capacity(partials.len());
    for (group, partial_values) in partials {
        if partial_values.len() != def.measures.len() {
            return Err(Error::internal(format!(
                "partial row for '{}' has {} values, definition has {} measures",
                def.name,
                partial_values.len(),
                def.measures.len()
            )));
        }
        let mut merged = match state.rows.get(group) {
            Some(existing) => existing.clone(),
            None => def.measures.iter().map(|m| m.combiner.initial()).collect(),
        };
        for (acc, partial) in merged.iter_mut().zip(partial_values.iter()) {
            acc.merge(partial)?;
        }
        staged.push((group.clone(), merged));
    }

    let rows_touched = staged.len();
    for (group, values) in staged {
        state.rows.insert(group, values);
    }
    state.watermark = Some(batch_id);
    Ok(MergeOutcome::Applied { rows_touched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_core::fold::fold_rows;
    use rollup_core::{DeviceType, EventRecord, EventType, StoredRow};
    use chrono::TimeZone;

    fn event(user_id: u64, event_type: EventType, revenue: f64) -> StoredRow {
        StoredRow::Event(EventRecord {
            event_id: user_id,
            user_id,
            event_type,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 14, 5, 0).unwrap(),
            page_url: "/".into(),
            session_id: "sess".into(),
            device_type: DeviceType::Desktop,
            browser: "Chrome".into(),
            country: "US".into(),
            duration_seconds: 0.0,
            revenue,
        })
    }

    fn store_and_def() -> (AggregateStore, Arc<AggregateDefinition>) {
        let registry = AggregateRegistry::builtin().unwrap();
        let def = registry.get("events_per_hour_by_user").unwrap().clone();
        (AggregateStore::new(&registry), def)
    }

    #[test]
    fn merge_advances_watermark_atomically() {
        let (store, def) = store_and_def();
        let rows = vec![
            event(1, EventType::PageView, 0.0),
            event(1, EventType::Purchase, 50.0),
        ];
        let partials = fold_rows(&def, rows.iter());

        let outcome = store.merge_batch(&def, 0, &partials).unwrap();
        assert_eq!(outcome, MergeOutcome::Applied { rows_touched: 1 });
        assert_eq!(store.watermark(&def.name).unwrap(), Some(0));

        let all = store.incremental_rows(&def).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value("event_count"), Some(2.0));
        assert_eq!(all[0].value("total_revenue"), Some(50.0));
    }

    #[test]
    fn replay_at_watermark_is_noop() {
        let (store, def) = store_and_def();
        let rows = vec![event(1, EventType::Purchase, 50.0)];
        let partials = fold_rows(&def, rows.iter());

        store.merge_batch(&def, 0, &partials).unwrap();
        let replay = store.merge_batch(&def, 0, &partials).unwrap();
        assert_eq!(replay, MergeOutcome::AlreadyApplied);

        let all = store.incremental_rows(&def).unwrap();
        assert_eq!(all[0].value("total_revenue"), Some(50.0));
    }

    #[test]
    fn try_merge_reports_contention() {
        let (store, def) = store_and_def();
        let partials = fold_rows(&def, [event(1, EventType::Click, 0.0)].iter());

        let guard = store.incremental_state(&def.name).unwrap().lock();
        let err = store.try_merge_batch(&def, 0, &partials).unwrap_err();
        assert!(matches!(err, Error::MergeConflict { .. }));
        drop(guard);

        store.try_merge_batch(&def, 0, &partials).unwrap();
    }

    #[test]
    fn publish_swaps_whole_result() {
        let registry = AggregateRegistry::builtin().unwrap();
        let def = registry.get("top_users_activity").unwrap().clone();
        let store = AggregateStore::new(&registry);

        let empty = store.published(&def.name).unwrap();
        assert!(empty.computed_at.is_none());

        let row = AggregateRow {
            group: GroupTuple(vec![GroupValue::U64(1)]),
            values: vec![
                MeasureValue::Count(10),
                MeasureValue::Unique(Default::default()),
                MeasureValue::Sum(99.0),
            ],
        };
        store.publish(&def, vec![row], Utc::now()).unwrap();

        // The earlier reader still sees the old (empty) result.
        assert!(empty.rows.is_empty());
        let current = store.published_rows(&def).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].value("event_count"), Some(10.0));
    }

    #[test]
    fn in_flight_guard_skips_second_cycle() {
        let registry = AggregateRegistry::builtin().unwrap();
        let store = AggregateStore::new(&registry);

        assert!(store.begin_recompute("top_users_activity").unwrap());
        assert!(!store.begin_recompute("top_users_activity").unwrap());
        store.finish_recompute("top_users_activity").unwrap();
        assert!(store.begin_recompute("top_users_activity").unwrap());
    }

    #[test]
    fn prune_drops_old_buckets_only() {
        let registry = AggregateRegistry::builtin().unwrap();
        let def = registry.get("events_per_hour_by_user").unwrap().clone();
        let store = AggregateStore::new(&registry);

        let partials = fold_rows(&def, [event(1, EventType::Click, 0.0)].iter());
        store.merge_batch(&def, 0, &partials).unwrap();

        let before_bucket = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(store.prune_rows_before(&def, before_bucket).unwrap(), 0);

        let after_bucket = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(store.prune_rows_before(&def, after_bucket).unwrap(), 1);
        assert!(store.incremental_rows(&def).unwrap().is_empty());
    }

    #[test]
    fn unknown_definition_errors() {
        let registry = AggregateRegistry::builtin().unwrap();
        let store = AggregateStore::new(&registry);
        assert!(matches!(
            store.watermark("nope"),
            Err(Error::UnknownDefinition(_))
        ));
    }
}
