//! Aggregate definition registry.
//!
//! The registry is immutable process-wide configuration: built once at
//! startup (from the config file or the built-in set), validated, and passed
//! by `Arc` into every worker. Definitions never change while the engine
//! runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::measure::{Combiner, Measure, SourceExpr};
use crate::records::{EventType, Granularity, GroupKey, OrderStatus, StreamKind};

/// Row filter applied before grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub event_type: Option<EventType>,
    pub order_status: Option<OrderStatus>,
}

/// Schedule parameters for SCHEDULED definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSpec {
    /// Seconds between recompute cycles.
    pub refresh_interval_secs: u64,
    /// Per-cycle deadline; an overrunning recompute is aborted.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// How far back the recompute scans base data.
    pub window_hours: u64,
    /// Measure name to rank by, descending.
    pub order_by: Option<String>,
    /// Row cap applied after ranking.
    pub limit: Option<usize>,
}

fn default_deadline_secs() -> u64 {
    30
}

impl ScheduledSpec {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours as i64)
    }
}

/// Update discipline of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discipline {
    /// Applied batch-by-batch through the rollup queue.
    Incremental,
    /// Periodically re-derived from base data and swapped in whole.
    Scheduled(ScheduledSpec),
}

/// Retention for the aggregate's own rows. Only meaningful when the leading
/// grouping key is a time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateRetention {
    pub max_age_hours: u64,
}

/// One aggregate definition. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDefinition {
    pub name: String,
    pub stream: StreamKind,
    pub group_by: Vec<GroupKey>,
    pub measures: Vec<Measure>,
    pub discipline: Discipline,
    #[serde(default)]
    pub filter: Option<RowFilter>,
    #[serde(default)]
    pub retention: Option<AggregateRetention>,
}

impl AggregateDefinition {
    pub fn is_incremental(&self) -> bool {
        matches!(self.discipline, Discipline::Incremental)
    }

    pub fn scheduled_spec(&self) -> Option<&ScheduledSpec> {
        match &self.discipline {
            Discipline::Scheduled(spec) => Some(spec),
            Discipline::Incremental => None,
        }
    }

    /// Index of a measure by name.
    pub fn measure_index(&self, name: &str) -> Option<usize> {
        self.measures.iter().position(|m| m.name == name)
    }

    /// Leading time-bucket granularity, if the definition has one.
    pub fn bucket_granularity(&self) -> Option<Granularity> {
        match self.group_by.first() {
            Some(GroupKey::Bucket(gran)) => Some(*gran),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(Error::invalid_definition(&self.name, message));

        if self.name.is_empty() {
            return Err(Error::invalid_definition("<unnamed>", "empty name"));
        }
        if self.group_by.is_empty() {
            return fail("at least one grouping key is required");
        }
        if self.measures.is_empty() {
            return fail("at least one measure is required");
        }

        let mut seen = HashSet::new();
        for measure in &self.measures {
            if measure.name.is_empty() {
                return fail("measure with empty name");
            }
            if !seen.insert(measure.name.as_str()) {
                return fail("duplicate measure name");
            }
        }

        if let Some(filter) = &self.filter {
            if filter.event_type.is_some() && self.stream != StreamKind::Events {
                return fail("event_type filter on a non-event stream");
            }
            if filter.order_status.is_some() && self.stream != StreamKind::Orders {
                return fail("order_status filter on a non-order stream");
            }
        }

        if self.retention.is_some() && self.bucket_granularity().is_none() {
            return fail("row retention requires a leading time-bucket grouping key");
        }

        if let Some(spec) = self.scheduled_spec() {
            if spec.refresh_interval_secs == 0 {
                return fail("refresh interval must be positive");
            }
            if spec.deadline_secs == 0 {
                return fail("deadline must be positive");
            }
            if spec.window_hours == 0 {
                return fail("scan window must be positive");
            }
            if let Some(order_by) = &spec.order_by {
                if self.measure_index(order_by).is_none() {
                    return fail("order_by names an unknown measure");
                }
            }
        } else if let Some(retention) = &self.retention {
            if retention.max_age_hours == 0 {
                return fail("row retention max_age must be positive");
            }
        }

        Ok(())
    }
}

/// Process-wide registry of aggregate definitions.
#[derive(Debug, Clone)]
pub struct AggregateRegistry {
    definitions: Vec<Arc<AggregateDefinition>>,
}

impl AggregateRegistry {
    /// Builds and validates a registry. Names must be unique.
    pub fn new(definitions: Vec<AggregateDefinition>) -> Result<Self> {
        let mut names = HashSet::new();
        for def in &definitions {
            def.validate()?;
            if !names.insert(def.name.clone()) {
                return Err(Error::invalid_definition(&def.name, "duplicate name"));
            }
        }
        Ok(Self {
            definitions: definitions.into_iter().map(Arc::new).collect(),
        })
    }

    /// The default definition set mirroring the dashboard the engine feeds.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_definitions())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AggregateDefinition>> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn all(&self) -> &[Arc<AggregateDefinition>] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Incremental definitions fed by the given stream.
    pub fn incremental_for(&self, stream: StreamKind) -> Vec<Arc<AggregateDefinition>> {
        self.definitions
            .iter()
            .filter(|d| d.is_incremental() && d.stream == stream)
            .cloned()
            .collect()
    }

    pub fn scheduled(&self) -> Vec<Arc<AggregateDefinition>> {
        self.definitions
            .iter()
            .filter(|d| !d.is_incremental())
            .cloned()
            .collect()
    }

    /// Rejects configurations where a scheduled recompute scans further back
    /// than its source stream retains data. Retention must never delete what
    /// a recompute still reads.
    pub fn check_scan_windows(
        &self,
        max_age_hours: impl Fn(StreamKind) -> Option<u64>,
    ) -> Result<()> {
        for def in &self.definitions {
            if let Some(spec) = def.scheduled_spec() {
                if let Some(max_age) = max_age_hours(def.stream) {
                    if spec.window_hours > max_age {
                        return Err(Error::invalid_definition(
                            &def.name,
                            format!(
                                "scan window {}h exceeds {} retention of {}h",
                                spec.window_hours,
                                def.stream.as_str(),
                                max_age
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn sum(name: &str, source: SourceExpr) -> Measure {
    Measure {
        name: name.into(),
        combiner: Combiner::Sum { source },
    }
}

fn count(name: &str, source: SourceExpr) -> Measure {
    Measure {
        name: name.into(),
        combiner: Combiner::Count { source },
    }
}

fn unique(name: &str, source: SourceExpr) -> Measure {
    Measure {
        name: name.into(),
        combiner: Combiner::UniqueApprox { source },
    }
}

fn ratio(name: &str, numerator: SourceExpr, denominator: SourceExpr) -> Measure {
    Measure {
        name: name.into(),
        combiner: Combiner::RatioState {
            numerator,
            denominator,
        },
    }
}

/// Built-in definitions, one per dashboard panel.
fn builtin_definitions() -> Vec<AggregateDefinition> {
    vec![
        AggregateDefinition {
            name: "events_per_hour_by_user".into(),
            stream: StreamKind::Events,
            group_by: vec![GroupKey::Bucket(Granularity::Hour), GroupKey::UserId],
            measures: vec![
                count("event_count", SourceExpr::One),
                sum("total_revenue", SourceExpr::RevenueOfType(EventType::Purchase)),
                count("purchases", SourceExpr::EventsOfType(EventType::Purchase)),
            ],
            discipline: Discipline::Incremental,
            filter: None,
            retention: Some(AggregateRetention { max_age_hours: 90 * 24 }),
        },
        AggregateDefinition {
            name: "event_type_totals".into(),
            stream: StreamKind::Events,
            group_by: vec![GroupKey::EventType],
            measures: vec![count("event_count", SourceExpr::One)],
            discipline: Discipline::Incremental,
            filter: None,
            retention: None,
        },
        AggregateDefinition {
            name: "country_minute_stats".into(),
            stream: StreamKind::Events,
            group_by: vec![GroupKey::Bucket(Granularity::Minute), GroupKey::Country],
            measures: vec![
                count("event_count", SourceExpr::One),
                unique("unique_users", SourceExpr::UserId),
                sum("total_revenue", SourceExpr::RevenueOfType(EventType::Purchase)),
            ],
            discipline: Discipline::Incremental,
            filter: None,
            retention: Some(AggregateRetention { max_age_hours: 7 * 24 }),
        },
        AggregateDefinition {
            name: "conversion_funnel_hourly".into(),
            stream: StreamKind::Events,
            group_by: vec![GroupKey::Bucket(Granularity::Hour)],
            measures: vec![
                ratio(
                    "cart_rate",
                    SourceExpr::EventsOfType(EventType::AddToCart),
                    SourceExpr::EventsOfType(EventType::PageView),
                ),
                ratio(
                    "purchase_rate",
                    SourceExpr::EventsOfType(EventType::Purchase),
                    SourceExpr::EventsOfType(EventType::AddToCart),
                ),
                ratio(
                    "overall_conversion",
                    SourceExpr::EventsOfType(EventType::Purchase),
                    SourceExpr::EventsOfType(EventType::PageView),
                ),
            ],
            discipline: Discipline::Incremental,
            filter: None,
            retention: Some(AggregateRetention { max_age_hours: 90 * 24 }),
        },
        AggregateDefinition {
            name: "avg_order_value_daily".into(),
            stream: StreamKind::Orders,
            group_by: vec![GroupKey::Bucket(Granularity::Day), GroupKey::PaymentMethod],
            measures: vec![
                Measure {
                    name: "avg_order_value".into(),
                    combiner: Combiner::AvgState {
                        source: SourceExpr::TotalAmount,
                    },
                },
                count("order_count", SourceExpr::One),
            ],
            discipline: Discipline::Incremental,
            filter: None,
            retention: Some(AggregateRetention { max_age_hours: 365 * 24 }),
        },
        AggregateDefinition {
            name: "top_users_activity".into(),
            stream: StreamKind::Events,
            group_by: vec![GroupKey::UserId],
            measures: vec![
                count("event_count", SourceExpr::One),
                unique("event_types", SourceExpr::EventTypeName),
                sum("total_revenue", SourceExpr::RevenueOfType(EventType::Purchase)),
            ],
            discipline: Discipline::Scheduled(ScheduledSpec {
                refresh_interval_secs: 60,
                deadline_secs: 30,
                window_hours: 6,
                order_by: Some("event_count".into()),
                limit: Some(100),
            }),
            filter: None,
            retention: None,
        },
        AggregateDefinition {
            name: "product_revenue_ranking".into(),
            stream: StreamKind::Orders,
            group_by: vec![GroupKey::ProductId],
            measures: vec![
                sum("revenue", SourceExpr::TotalAmount),
                sum("units_sold", SourceExpr::Quantity),
                count("order_count", SourceExpr::One),
            ],
            discipline: Discipline::Scheduled(ScheduledSpec {
                refresh_interval_secs: 300,
                deadline_secs: 60,
                window_hours: 30 * 24,
                order_by: Some("revenue".into()),
                limit: Some(50),
            }),
            filter: Some(RowFilter {
                event_type: None,
                order_status: Some(OrderStatus::Completed),
            }),
            retention: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_validates() {
        let registry = AggregateRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 7);
        assert_eq!(registry.incremental_for(StreamKind::Events).len(), 4);
        assert_eq!(registry.incremental_for(StreamKind::Orders).len(), 1);
        assert_eq!(registry.scheduled().len(), 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut defs = builtin_definitions();
        let dup = defs[0].clone();
        defs.push(dup);
        assert!(AggregateRegistry::new(defs).is_err());
    }

    #[test]
    fn order_by_must_name_a_measure() {
        let mut defs = builtin_definitions();
        for def in &mut defs {
            if let Discipline::Scheduled(spec) = &mut def.discipline {
                spec.order_by = Some("no_such_measure".into());
            }
        }
        assert!(AggregateRegistry::new(defs).is_err());
    }

    #[test]
    fn scan_window_must_fit_stream_retention() {
        let registry = AggregateRegistry::builtin().unwrap();
        // product_revenue_ranking scans 30 days; a 7-day order retention is
        // too tight.
        let err = registry.check_scan_windows(|stream| match stream {
            StreamKind::Events => Some(90 * 24),
            StreamKind::Orders => Some(7 * 24),
        });
        assert!(err.is_err());

        registry
            .check_scan_windows(|_| Some(365 * 24))
            .expect("generous retention passes");
    }

    #[test]
    fn mismatched_filter_stream_rejected() {
        let mut defs = builtin_definitions();
        defs[0].filter = Some(RowFilter {
            event_type: None,
            order_status: Some(OrderStatus::Completed),
        });
        assert!(AggregateRegistry::new(defs).is_err());
    }

    #[test]
    fn definitions_round_trip_through_serde() {
        let defs = builtin_definitions();
        let json = serde_json::to_string(&defs).unwrap();
        let back: Vec<AggregateDefinition> = serde_json::from_str(&json).unwrap();
        assert_eq!(defs, back);
    }
}
