//! End-to-end tests for the ingest -> rollup path.
//!
//! Drives the real sink, queues, and workers, then reads back finalized
//! aggregate rows.

use aggregate_store::BaseStore;
use integration_tests::{fixtures, setup::TestContext};
use rollup_core::{EventType, Granularity, GroupTuple, GroupValue, StreamKind};

/// Ingesting a page view and a $50 purchase yields an hourly row with
/// event_count=2 and total_revenue=50 for that (hour, user).
#[tokio::test]
async fn hourly_rollup_counts_events_and_revenue() {
    let ctx = TestContext::new();
    let _workers = ctx.start_workers();

    let ts = fixtures::mid_hour_timestamp();
    let batch = vec![
        fixtures::event_at(ts, 1, 1, EventType::PageView, 0.0),
        fixtures::event_at(ts, 2, 1, EventType::Purchase, 50.0),
    ];
    let batch_id = ctx.sink.ingest(StreamKind::Events, batch).await.unwrap();
    ctx.wait_for_watermark("events_per_hour_by_user", batch_id)
        .await;

    let def = ctx.registry.get("events_per_hour_by_user").unwrap();
    let key = GroupTuple(vec![
        GroupValue::Time(Granularity::Hour.truncate(ts)),
        GroupValue::U64(1),
    ]);
    let row = ctx
        .aggregates
        .incremental_row(def, &key)
        .unwrap()
        .expect("hourly row");
    assert_eq!(row.value("event_count"), Some(2.0));
    assert_eq!(row.value("total_revenue"), Some(50.0));
    assert_eq!(row.value("purchases"), Some(1.0));
}

/// B1 then B2 and B2 then B1 converge to the same total.
#[tokio::test]
async fn batch_order_does_not_change_totals() {
    let ts = fixtures::mid_hour_timestamp();
    let b1 = vec![
        fixtures::event_at(ts, 1, 1, EventType::PageView, 0.0),
        fixtures::event_at(ts, 2, 1, EventType::Purchase, 50.0),
    ];
    let b2 = vec![fixtures::event_at(ts, 3, 1, EventType::Purchase, 20.0)];

    let mut totals = Vec::new();
    for batches in [vec![b1.clone(), b2.clone()], vec![b2, b1]] {
        let ctx = TestContext::new();
        let _workers = ctx.start_workers();

        let mut last = 0;
        for batch in batches {
            last = ctx.sink.ingest(StreamKind::Events, batch).await.unwrap();
        }
        ctx.wait_for_watermark("events_per_hour_by_user", last).await;

        let def = ctx.registry.get("events_per_hour_by_user").unwrap();
        let key = GroupTuple(vec![
            GroupValue::Time(Granularity::Hour.truncate(ts)),
            GroupValue::U64(1),
        ]);
        let row = ctx
            .aggregates
            .incremental_row(def, &key)
            .unwrap()
            .expect("hourly row");
        totals.push(row.value("total_revenue").unwrap());
    }

    assert_eq!(totals[0], 70.0);
    assert_eq!(totals[1], 70.0);
}

/// One ingested batch fans out to every incremental definition on the
/// stream, each applying independently.
#[tokio::test]
async fn batch_fans_out_to_all_event_definitions() {
    let ctx = TestContext::new();
    let _workers = ctx.start_workers();

    let ts = fixtures::mid_hour_timestamp();
    let batch = vec![
        fixtures::event_at(ts, 1, 1, EventType::PageView, 0.0),
        fixtures::event_at(ts, 2, 2, EventType::AddToCart, 10.0),
        fixtures::event_at(ts, 3, 2, EventType::Purchase, 30.0),
    ];
    let batch_id = ctx.sink.ingest(StreamKind::Events, batch).await.unwrap();

    for def in ctx.registry.incremental_for(StreamKind::Events) {
        ctx.wait_for_watermark(&def.name, batch_id).await;
    }

    // event_type_totals sees one row per type.
    let totals_def = ctx.registry.get("event_type_totals").unwrap();
    let rows = ctx.aggregates.incremental_rows(totals_def).unwrap();
    assert_eq!(rows.len(), 3);

    // The funnel ratio finalizes at read time: 1 purchase / 1 page view.
    let funnel_def = ctx.registry.get("conversion_funnel_hourly").unwrap();
    let key = GroupTuple(vec![GroupValue::Time(Granularity::Hour.truncate(ts))]);
    let funnel = ctx
        .aggregates
        .incremental_row(funnel_def, &key)
        .unwrap()
        .expect("funnel row");
    assert_eq!(funnel.value("overall_conversion"), Some(1.0));
    assert_eq!(funnel.value("cart_rate"), Some(1.0));
}

/// A batch with any invalid record is rejected wholesale and reaches no
/// aggregate.
#[tokio::test]
async fn invalid_batch_has_no_side_effects() {
    let ctx = TestContext::new();
    let _workers = ctx.start_workers();

    let ts = fixtures::mid_hour_timestamp();
    let mut bad = fixtures::event_at(ts, 2, 1, EventType::PageView, 0.0);
    if let rollup_core::Record::Event(e) = &mut bad {
        e.revenue = 10.0; // page views cannot carry revenue
    }
    let batch = vec![fixtures::event_at(ts, 1, 1, EventType::Purchase, 50.0), bad];

    let err = ctx.sink.ingest(StreamKind::Events, batch).await.unwrap_err();
    assert!(matches!(err, rollup_core::Error::Validation(_)));

    assert!(ctx
        .base
        .partitions(StreamKind::Events)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        ctx.aggregates.watermark("events_per_hour_by_user").unwrap(),
        None
    );
}
