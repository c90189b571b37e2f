//! Record types for the two base streams and their downsampled forms.
//!
//! Records are immutable tuples; corrections arrive as new records. Each
//! record maps to a monthly partition (`YYYYMM` of its timestamp) and orders
//! within a partition by `(timestamp, id)`.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::measure::{MeasureInput, SourceExpr};
use crate::sketch::HllSketch;

/// Monotonically increasing per-stream batch identifier.
pub type BatchId = u64;

/// The two base streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Events,
    Orders,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Orders => "orders",
        }
    }

    pub const ALL: [StreamKind; 2] = [StreamKind::Events, StreamKind::Orders];
}

impl std::str::FromStr for StreamKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "events" => Ok(Self::Events),
            "orders" => Ok(Self::Orders),
            other => Err(crate::Error::UnknownStream(other.to_string())),
        }
    }
}

/// Monthly partition key (`YYYYMM` of the record timestamp).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self(ts.year() as u32 * 100 + ts.month())
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// Time-bucket granularity for grouping keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// Truncates a timestamp down to this granularity.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let t = match self {
            Self::Minute => ts.with_second(0),
            Self::Hour => ts.with_minute(0).and_then(|t| t.with_second(0)),
            Self::Day => ts
                .with_hour(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0)),
        };
        t.and_then(|t| t.with_nanosecond(0)).unwrap_or(ts)
    }
}

/// Dimension an aggregate groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    /// Truncated record timestamp.
    Bucket(Granularity),
    EventType,
    Country,
    DeviceType,
    Browser,
    UserId,
    ProductId,
    Status,
    PaymentMethod,
}

/// One grouping-key value. No floats: grouping values must be hashable and
/// totally ordered.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum GroupValue {
    Time(DateTime<Utc>),
    U64(u64),
    Str(String),
}

/// The full grouping-key tuple an aggregate row is keyed by.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GroupTuple(pub Vec<GroupValue>);

/// Event type taxonomy, as produced by the storefront tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Click,
    Search,
    Login,
    Logout,
    Purchase,
    AddToCart,
    RemoveFromCart,
    Checkout,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageView => "page_view",
            Self::Click => "click",
            Self::Search => "search",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Purchase => "purchase",
            Self::AddToCart => "add_to_cart",
            Self::RemoveFromCart => "remove_from_cart",
            Self::Checkout => "checkout",
        }
    }

    /// Only these event types may carry a non-zero revenue amount.
    pub fn carries_revenue(&self) -> bool {
        matches!(self, Self::Purchase | Self::AddToCart | Self::Checkout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Completed,
    Pending,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

/// A single site event.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventRecord {
    pub event_id: u64,
    pub user_id: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[validate(length(min = 1, max = 2048))]
    pub page_url: String,
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    pub device_type: DeviceType,
    #[validate(length(max = 64))]
    pub browser: String,
    /// Two-letter country code.
    #[validate(length(min = 2, max = 2))]
    pub country: String,
    #[validate(range(min = 0.0, max = 86400.0))]
    pub duration_seconds: f64,
    #[validate(range(min = 0.0, max = 1000000.0))]
    pub revenue: f64,
}

/// A single order line.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderRecord {
    pub order_id: u64,
    pub user_id: u64,
    pub product_id: u64,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: u32,
    pub timestamp: DateTime<Utc>,
    #[validate(range(min = 0.0, max = 1000000.0))]
    pub total_amount: f64,
    pub status: OrderStatus,
    #[validate(length(min = 1, max = 32))]
    pub payment_method: String,
}

/// Hourly summary row replacing raw events after downsampling.
///
/// Carries pre-summed measures, a row weight, and a merged user sketch so
/// SUM/COUNT totals are preserved exactly and UNIQUE-APPROX within sketch
/// error. Dimensions outside the downsample grouping (device, browser,
/// session) are gone for good.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    /// Hour-resolution bucket.
    pub bucket: DateTime<Utc>,
    pub event_type: EventType,
    pub country: String,
    pub row_count: u64,
    pub total_revenue: f64,
    pub total_duration: f64,
    pub users: HllSketch,
}

/// Hourly summary row replacing raw orders after downsampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub bucket: DateTime<Utc>,
    pub status: OrderStatus,
    pub payment_method: String,
    pub row_count: u64,
    pub total_amount: f64,
    pub total_quantity: u64,
    pub users: HllSketch,
}

/// A record as submitted to the ingestion sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "lowercase")]
pub enum Record {
    Event(EventRecord),
    Order(OrderRecord),
}

impl Record {
    pub fn stream(&self) -> StreamKind {
        match self {
            Self::Event(_) => StreamKind::Events,
            Self::Order(_) => StreamKind::Orders,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Event(e) => e.timestamp,
            Self::Order(o) => o.timestamp,
        }
    }

    pub fn into_stored(self) -> StoredRow {
        match self {
            Self::Event(e) => StoredRow::Event(e),
            Self::Order(o) => StoredRow::Order(o),
        }
    }
}

/// A row as held by the base store: raw, or a downsampled summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredRow {
    Event(EventRecord),
    Order(OrderRecord),
    EventSummary(EventSummary),
    OrderSummary(OrderSummary),
}

impl StoredRow {
    pub fn stream(&self) -> StreamKind {
        match self {
            Self::Event(_) | Self::EventSummary(_) => StreamKind::Events,
            Self::Order(_) | Self::OrderSummary(_) => StreamKind::Orders,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Event(e) => e.timestamp,
            Self::Order(o) => o.timestamp,
            Self::EventSummary(s) => s.bucket,
            Self::OrderSummary(s) => s.bucket,
        }
    }

    pub fn partition(&self) -> PartitionId {
        PartitionId::of(self.timestamp())
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, Self::EventSummary(_) | Self::OrderSummary(_))
    }

    /// How many raw records this row stands for.
    pub fn weight(&self) -> u64 {
        match self {
            Self::Event(_) | Self::Order(_) => 1,
            Self::EventSummary(s) => s.row_count,
            Self::OrderSummary(s) => s.row_count,
        }
    }

    /// Primary ordering key within a partition.
    pub fn sort_key(&self) -> (DateTime<Utc>, u64) {
        let id = match self {
            Self::Event(e) => e.event_id,
            Self::Order(o) => o.order_id,
            Self::EventSummary(_) | Self::OrderSummary(_) => 0,
        };
        (self.timestamp(), id)
    }

    /// User the row belongs to. Summaries fold users into a sketch and
    /// return `None`.
    pub fn user_id(&self) -> Option<u64> {
        match self {
            Self::Event(e) => Some(e.user_id),
            Self::Order(o) => Some(o.user_id),
            Self::EventSummary(_) | Self::OrderSummary(_) => None,
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::Event(e) => Some(e.event_type),
            Self::EventSummary(s) => Some(s.event_type),
            _ => None,
        }
    }

    pub fn order_status(&self) -> Option<OrderStatus> {
        match self {
            Self::Order(o) => Some(o.status),
            Self::OrderSummary(s) => Some(s.status),
            _ => None,
        }
    }

    /// Extracts one grouping-key value. `None` means this row can no longer
    /// contribute to the dimension (e.g. a summary asked for a per-minute
    /// bucket or a dimension the downsample grouping dropped).
    pub fn group_value(&self, key: &GroupKey) -> Option<GroupValue> {
        match (key, self) {
            (GroupKey::Bucket(gran), row) => match (gran, row.is_summary()) {
                // Summaries are hour-resolution; finer buckets are gone.
                (Granularity::Minute, true) => None,
                _ => Some(GroupValue::Time(gran.truncate(row.timestamp()))),
            },
            (GroupKey::EventType, row) => row
                .event_type()
                .map(|t| GroupValue::Str(t.as_str().to_string())),
            (GroupKey::Country, Self::Event(e)) => Some(GroupValue::Str(e.country.clone())),
            (GroupKey::Country, Self::EventSummary(s)) => {
                Some(GroupValue::Str(s.country.clone()))
            }
            (GroupKey::DeviceType, Self::Event(e)) => {
                Some(GroupValue::Str(e.device_type.as_str().to_string()))
            }
            (GroupKey::Browser, Self::Event(e)) => Some(GroupValue::Str(e.browser.clone())),
            (GroupKey::UserId, Self::Event(e)) => Some(GroupValue::U64(e.user_id)),
            (GroupKey::UserId, Self::Order(o)) => Some(GroupValue::U64(o.user_id)),
            (GroupKey::ProductId, Self::Order(o)) => Some(GroupValue::U64(o.product_id)),
            (GroupKey::Status, row) => row
                .order_status()
                .map(|s| GroupValue::Str(s.as_str().to_string())),
            (GroupKey::PaymentMethod, Self::Order(o)) => {
                Some(GroupValue::Str(o.payment_method.clone()))
            }
            (GroupKey::PaymentMethod, Self::OrderSummary(s)) => {
                Some(GroupValue::Str(s.payment_method.clone()))
            }
            _ => None,
        }
    }

    /// Extracts the input a measure's combiner consumes from this row.
    pub fn measure_input(&self, source: &SourceExpr) -> MeasureInput<'_> {
        match (source, self) {
            (SourceExpr::One, row) => MeasureInput::Count(row.weight()),

            (SourceExpr::EventsOfType(t), Self::Event(e)) => {
                MeasureInput::Count((e.event_type == *t) as u64)
            }
            (SourceExpr::EventsOfType(t), Self::EventSummary(s)) => {
                MeasureInput::Count(if s.event_type == *t { s.row_count } else { 0 })
            }

            (SourceExpr::Revenue, Self::Event(e)) => MeasureInput::Number(e.revenue),
            (SourceExpr::Revenue, Self::EventSummary(s)) => {
                MeasureInput::Number(s.total_revenue)
            }
            (SourceExpr::RevenueOfType(t), Self::Event(e)) => {
                MeasureInput::Number(if e.event_type == *t { e.revenue } else { 0.0 })
            }
            (SourceExpr::RevenueOfType(t), Self::EventSummary(s)) => {
                MeasureInput::Number(if s.event_type == *t { s.total_revenue } else { 0.0 })
            }

            (SourceExpr::DurationSeconds, Self::Event(e)) => {
                MeasureInput::Number(e.duration_seconds)
            }
            (SourceExpr::DurationSeconds, Self::EventSummary(s)) => {
                MeasureInput::Number(s.total_duration)
            }

            (SourceExpr::UserId, Self::Event(e)) => MeasureInput::Id(e.user_id),
            (SourceExpr::UserId, Self::Order(o)) => MeasureInput::Id(o.user_id),
            (SourceExpr::UserId, Self::EventSummary(s)) => MeasureInput::Sketch(&s.users),
            (SourceExpr::UserId, Self::OrderSummary(s)) => MeasureInput::Sketch(&s.users),

            (SourceExpr::SessionId, Self::Event(e)) => MeasureInput::Key(&e.session_id),
            (SourceExpr::EventTypeName, row) => match row.event_type() {
                Some(t) => MeasureInput::Key(t.as_str()),
                None => MeasureInput::Absent,
            },

            (SourceExpr::TotalAmount, Self::Order(o)) => MeasureInput::Number(o.total_amount),
            (SourceExpr::TotalAmount, Self::OrderSummary(s)) => {
                MeasureInput::Number(s.total_amount)
            }
            (SourceExpr::Quantity, Self::Order(o)) => {
                MeasureInput::Number(o.quantity as f64)
            }
            (SourceExpr::Quantity, Self::OrderSummary(s)) => {
                MeasureInput::Number(s.total_quantity as f64)
            }

            _ => MeasureInput::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(ts: DateTime<Utc>) -> EventRecord {
        EventRecord {
            event_id: 1,
            user_id: 7,
            event_type: EventType::PageView,
            timestamp: ts,
            page_url: "/home".into(),
            session_id: "sess-7-1".into(),
            device_type: DeviceType::Desktop,
            browser: "Firefox".into(),
            country: "US".into(),
            duration_seconds: 12.5,
            revenue: 0.0,
        }
    }

    #[test]
    fn partition_id_is_yyyymm() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        assert_eq!(PartitionId::of(ts), PartitionId(202403));
        assert_eq!(PartitionId::of(ts).to_string(), "202403");
    }

    #[test]
    fn granularity_truncation() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 10, 42, 37).unwrap();
        assert_eq!(
            Granularity::Hour.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Day.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn summary_refuses_minute_buckets() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let row = StoredRow::EventSummary(EventSummary {
            bucket: ts,
            event_type: EventType::PageView,
            country: "US".into(),
            row_count: 10,
            total_revenue: 0.0,
            total_duration: 0.0,
            users: HllSketch::default(),
        });
        assert_eq!(row.group_value(&GroupKey::Bucket(Granularity::Minute)), None);
        assert_eq!(
            row.group_value(&GroupKey::Bucket(Granularity::Hour)),
            Some(GroupValue::Time(ts))
        );
        assert_eq!(row.weight(), 10);
    }

    #[test]
    fn raw_row_answers_dimensions() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        let row = StoredRow::Event(event(ts));
        assert_eq!(
            row.group_value(&GroupKey::UserId),
            Some(GroupValue::U64(7))
        );
        assert_eq!(
            row.group_value(&GroupKey::Country),
            Some(GroupValue::Str("US".into()))
        );
        assert_eq!(row.group_value(&GroupKey::ProductId), None);
    }
}
