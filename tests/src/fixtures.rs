//! Record builders for integration tests.

use chrono::{DateTime, Duration, Utc};

use rollup_core::{
    DeviceType, EventRecord, EventType, Granularity, OrderRecord, OrderStatus, Record,
    StoredRow,
};

/// A timestamp safely in the middle of a fully elapsed hour, so tests that
/// group by hour never straddle a boundary while they run.
pub fn mid_hour_timestamp() -> DateTime<Utc> {
    let now = Utc::now();
    let candidate = Granularity::Hour.truncate(now) + Duration::minutes(30);
    if candidate > now {
        candidate - Duration::hours(1)
    } else {
        candidate
    }
}

/// An event record at a given timestamp.
pub fn event_at(
    ts: DateTime<Utc>,
    event_id: u64,
    user_id: u64,
    event_type: EventType,
    revenue: f64,
) -> Record {
    Record::Event(EventRecord {
        event_id,
        user_id,
        event_type,
        timestamp: ts,
        page_url: "/products".into(),
        session_id: format!("sess-{}-1", user_id),
        device_type: DeviceType::Desktop,
        browser: "Firefox".into(),
        country: "US".into(),
        duration_seconds: 4.0,
        revenue,
    })
}

/// An event record with a recent, hour-safe timestamp.
pub fn event(event_id: u64, user_id: u64, event_type: EventType, revenue: f64) -> Record {
    event_at(mid_hour_timestamp(), event_id, user_id, event_type, revenue)
}

/// An order record at a given timestamp.
pub fn order_at(
    ts: DateTime<Utc>,
    order_id: u64,
    product_id: u64,
    total_amount: f64,
    status: OrderStatus,
) -> Record {
    Record::Order(OrderRecord {
        order_id,
        user_id: order_id % 50,
        product_id,
        quantity: 1,
        timestamp: ts,
        total_amount,
        status,
        payment_method: "credit_card".into(),
    })
}

/// Stored event rows for seeding old partitions directly in the base store
/// (the live sink rejects stale timestamps).
pub fn stored_events_at(
    ts: DateTime<Utc>,
    count: u64,
    event_type: EventType,
    revenue_each: f64,
) -> Vec<StoredRow> {
    (0..count)
        .map(|i| {
            event_at(ts + Duration::seconds(i as i64), 1000 + i, 1 + (i % 10), event_type, revenue_each)
                .into_stored()
        })
        .collect()
}
