//! Measure combiners and mergeable aggregate values.
//!
//! Every combiner is associative and commutative, so partial rows from
//! concurrently applied batches merge to the same result in any order.
//! STATE combiners keep an opaque intermediate representation; turning it
//! into a displayable number happens only in `finalize`, never in place.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::records::{EventType, StoredRow};
use crate::sketch::HllSketch;

/// Source expression a measure reads from each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceExpr {
    /// Row count (summary rows count their full weight).
    One,
    /// Rows of one event type.
    EventsOfType(EventType),
    Revenue,
    /// Revenue restricted to one event type.
    RevenueOfType(EventType),
    DurationSeconds,
    UserId,
    SessionId,
    EventTypeName,
    TotalAmount,
    Quantity,
}

/// The value a combiner consumes from a single row.
#[derive(Debug, Clone, Copy)]
pub enum MeasureInput<'a> {
    Count(u64),
    Number(f64),
    Id(u64),
    Key(&'a str),
    Sketch(&'a HllSketch),
    /// Row cannot supply this expression (wrong stream, or the dimension was
    /// lost to downsampling). The row is skipped for this measure.
    Absent,
}

impl MeasureInput<'_> {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Count(n) => Some(*n as f64),
            Self::Number(x) => Some(*x),
            _ => None,
        }
    }
}

/// One measure of an aggregate definition: a combiner over source
/// expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    #[serde(flatten)]
    pub combiner: Combiner,
}

/// Update discipline of a single measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "combiner", rename_all = "snake_case")]
pub enum Combiner {
    /// Final-form addition.
    Sum { source: SourceExpr },
    /// Final-form row counting.
    Count { source: SourceExpr },
    /// Distinct-count sketch union.
    UniqueApprox { source: SourceExpr },
    /// Mergeable average state, finalized to sum/count at read time.
    AvgState { source: SourceExpr },
    /// Mergeable ratio state, finalized to numerator/denominator at read
    /// time (e.g. purchases per page view).
    RatioState {
        numerator: SourceExpr,
        denominator: SourceExpr,
    },
}

impl Combiner {
    /// Identity value for this combiner.
    pub fn initial(&self) -> MeasureValue {
        match self {
            Self::Sum { .. } => MeasureValue::Sum(0.0),
            Self::Count { .. } => MeasureValue::Count(0),
            Self::UniqueApprox { .. } => MeasureValue::Unique(HllSketch::default()),
            Self::AvgState { .. } => MeasureValue::Avg(AvgState::default()),
            Self::RatioState { .. } => MeasureValue::Ratio(RatioState::default()),
        }
    }

    /// Folds one row into an accumulator produced by `initial`.
    pub fn accumulate(&self, acc: &mut MeasureValue, row: &StoredRow) {
        match (self, acc) {
            (Self::Sum { source }, MeasureValue::Sum(sum)) => {
                if let Some(x) = row.measure_input(source).as_f64() {
                    *sum += x;
                }
            }
            (Self::Count { source }, MeasureValue::Count(count)) => {
                if let MeasureInput::Count(n) = row.measure_input(source) {
                    *count += n;
                }
            }
            (Self::UniqueApprox { source }, MeasureValue::Unique(sketch)) => {
                match row.measure_input(source) {
                    MeasureInput::Id(id) => sketch.insert(&id),
                    MeasureInput::Key(key) => sketch.insert(&key),
                    MeasureInput::Sketch(other) => sketch.union(other),
                    _ => {}
                }
            }
            (Self::AvgState { source }, MeasureValue::Avg(state)) => {
                if let Some(x) = row.measure_input(source).as_f64() {
                    state.sum += x;
                    state.count += row.weight();
                }
            }
            (
                Self::RatioState {
                    numerator,
                    denominator,
                },
                MeasureValue::Ratio(state),
            ) => {
                if let Some(x) = row.measure_input(numerator).as_f64() {
                    state.numerator += x;
                }
                if let Some(x) = row.measure_input(denominator).as_f64() {
                    state.denominator += x;
                }
            }
            // Accumulator variants never drift from their combiner; defs are
            // immutable after registration.
            _ => {}
        }
    }
}

/// Intermediate state for an average (avg-of-avgs safe).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AvgState {
    pub sum: f64,
    pub count: u64,
}

/// Intermediate state for a ratio.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RatioState {
    pub numerator: f64,
    pub denominator: f64,
}

/// A partial or fully merged measure value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeasureValue {
    Sum(f64),
    Count(u64),
    Unique(HllSketch),
    Avg(AvgState),
    Ratio(RatioState),
}

impl MeasureValue {
    /// Merges another partial into this one. Associative and commutative for
    /// every variant.
    pub fn merge(&mut self, other: &MeasureValue) -> Result<()> {
        match (self, other) {
            (Self::Sum(a), Self::Sum(b)) => *a += b,
            (Self::Count(a), Self::Count(b)) => *a += b,
            (Self::Unique(a), Self::Unique(b)) => a.union(b),
            (Self::Avg(a), Self::Avg(b)) => {
                a.sum += b.sum;
                a.count += b.count;
            }
            (Self::Ratio(a), Self::Ratio(b)) => {
                a.numerator += b.numerator;
                a.denominator += b.denominator;
            }
            (a, b) => {
                return Err(Error::internal(format!(
                    "measure value mismatch: {} vs {}",
                    a.kind(),
                    b.kind()
                )))
            }
        }
        Ok(())
    }

    /// Read-time finalization. Does not mutate stored state.
    pub fn finalize(&self) -> f64 {
        match self {
            Self::Sum(x) => *x,
            Self::Count(n) => *n as f64,
            Self::Unique(sketch) => sketch.estimate() as f64,
            Self::Avg(s) => {
                if s.count == 0 {
                    0.0
                } else {
                    s.sum / s.count as f64
                }
            }
            Self::Ratio(s) => {
                if s.denominator == 0.0 {
                    0.0
                } else {
                    s.numerator / s.denominator
                }
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Sum(_) => "sum",
            Self::Count(_) => "count",
            Self::Unique(_) => "unique_approx",
            Self::Avg(_) => "avg_state",
            Self::Ratio(_) => "ratio_state",
        }
    }
}
