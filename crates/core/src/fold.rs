//! Grouping fold shared by the incremental and scheduled execution paths.
//!
//! Folding a set of rows yields one partial row per distinct grouping tuple
//! (in-batch pre-aggregation for the rollup path, the full result set for a
//! recompute). A row is skipped when it fails the definition's filter or
//! cannot supply every grouping key.

use std::collections::HashMap;

use crate::measure::MeasureValue;
use crate::records::{GroupTuple, StoredRow};
use crate::registry::AggregateDefinition;

/// Partial measure values per grouping tuple.
pub type PartialRows = HashMap<GroupTuple, Vec<MeasureValue>>;

/// Whether a row passes the definition's stream and filter checks.
pub fn row_matches(def: &AggregateDefinition, row: &StoredRow) -> bool {
    if row.stream() != def.stream {
        return false;
    }
    if let Some(filter) = &def.filter {
        if let Some(want) = filter.event_type {
            if row.event_type() != Some(want) {
                return false;
            }
        }
        if let Some(want) = filter.order_status {
            if row.order_status() != Some(want) {
                return false;
            }
        }
    }
    true
}

/// Builds the grouping tuple for a row, or `None` if any key is
/// unanswerable.
pub fn group_tuple(def: &AggregateDefinition, row: &StoredRow) -> Option<GroupTuple> {
    let mut values = Vec::with_capacity(def.group_by.len());
    for key in &def.group_by {
        values.push(row.group_value(key)?);
    }
    Some(GroupTuple(values))
}

/// Folds rows into one partial row per grouping tuple.
pub fn fold_rows<'a>(
    def: &AggregateDefinition,
    rows: impl IntoIterator<Item = &'a StoredRow>,
) -> PartialRows {
    let mut partials = PartialRows::new();
    for row in rows {
        if !row_matches(def, row) {
            continue;
        }
        let Some(tuple) = group_tuple(def, row) else {
            continue;
        };
        let values = partials
            .entry(tuple)
            .or_insert_with(|| def.measures.iter().map(|m| m.combiner.initial()).collect());
        for (measure, acc) in def.measures.iter().zip(values.iter_mut()) {
            measure.combiner.accumulate(acc, row);
        }
    }
    partials
}
