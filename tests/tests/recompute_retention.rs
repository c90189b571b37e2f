//! Recompute and retention lifecycle tests.
//!
//! Covers the coordination between scheduled recomputes (snapshot reads,
//! atomic swaps) and the retention manager (partition drops, downsampling,
//! snapshot-race deferral).

use chrono::{Duration, Utc};

use aggregate_store::BaseStore;
use integration_tests::{fixtures, setup::TestContext};
use rollup_core::{
    AggregateDefinition, Combiner, Discipline, EventType, Granularity, GroupKey, Measure,
    OrderStatus, RetentionPolicy, ScheduledSpec, SourceExpr, StreamKind,
};
use worker::{RecomputeEngine, RetentionConfig, RetentionWorker};

fn ranking_definition() -> AggregateDefinition {
    AggregateDefinition {
        name: "revenue_ranking".into(),
        stream: StreamKind::Orders,
        group_by: vec![GroupKey::ProductId],
        measures: vec![Measure {
            name: "revenue".into(),
            combiner: Combiner::Sum {
                source: SourceExpr::TotalAmount,
            },
        }],
        discipline: Discipline::Scheduled(ScheduledSpec {
            refresh_interval_secs: 60,
            deadline_secs: 30,
            window_hours: 365 * 24,
            order_by: Some("revenue".into()),
            limit: None,
        }),
        filter: None,
        retention: None,
    }
}

fn hourly_stats_definition() -> AggregateDefinition {
    AggregateDefinition {
        name: "hourly_event_type_stats".into(),
        stream: StreamKind::Events,
        group_by: vec![GroupKey::Bucket(Granularity::Hour), GroupKey::EventType],
        measures: vec![
            Measure {
                name: "event_count".into(),
                combiner: Combiner::Count {
                    source: SourceExpr::One,
                },
            },
            Measure {
                name: "total_revenue".into(),
                combiner: Combiner::Sum {
                    source: SourceExpr::RevenueOfType(EventType::Purchase),
                },
            },
            Measure {
                name: "unique_users".into(),
                combiner: Combiner::UniqueApprox {
                    source: SourceExpr::UserId,
                },
            },
        ],
        discipline: Discipline::Scheduled(ScheduledSpec {
            refresh_interval_secs: 60,
            deadline_secs: 30,
            window_hours: 90 * 24,
            order_by: None,
            limit: None,
        }),
        filter: None,
        retention: None,
    }
}

/// A ranking recompute reads one consistent snapshot: a snapshot held
/// across a retention drop still sees every row, the published result only
/// changes at the next complete recompute, and that recompute reflects the
/// post-deletion state.
#[tokio::test]
async fn ranking_survives_concurrent_retention_drop() {
    let ctx = TestContext::with_definitions(vec![ranking_definition()]);
    let def = ctx.registry.get("revenue_ranking").unwrap().clone();
    let engine = RecomputeEngine::new(ctx.base.clone(), ctx.aggregates.clone());

    let old_ts = Utc::now() - Duration::days(120);
    let recent_ts = Utc::now() - Duration::hours(1);
    ctx.base
        .append(
            StreamKind::Orders,
            vec![fixtures::order_at(old_ts, 1, 1, 500.0, OrderStatus::Completed).into_stored()],
        )
        .await
        .unwrap();
    ctx.base
        .append(
            StreamKind::Orders,
            vec![fixtures::order_at(recent_ts, 2, 2, 100.0, OrderStatus::Completed).into_stored()],
        )
        .await
        .unwrap();

    engine.recompute(&def).await.unwrap();
    let before = ctx.aggregates.published_rows(&def).unwrap();
    assert_eq!(before.len(), 2);
    assert_eq!(before[0].value("revenue"), Some(500.0));

    // An in-flight reader's snapshot, taken before retention runs.
    let snapshot = ctx.base.snapshot(StreamKind::Orders, None).await.unwrap();

    let retention = RetentionWorker::new(
        ctx.base.clone(),
        ctx.aggregates.clone(),
        ctx.registry.clone(),
        RetentionConfig {
            events: RetentionPolicy::delete_after(365 * 24),
            orders: RetentionPolicy::delete_after(30 * 24),
        },
    );
    let report = retention.run().await.unwrap();
    assert_eq!(report.partitions_dropped, 1);
    assert_eq!(report.rows_deleted, 1);

    // The drop proceeded, but the held snapshot still reads both rows;
    // an in-flight recompute never sees a half-deleted mixture.
    assert_eq!(snapshot.row_count(), 2);

    // The published ranking is untouched until the next complete cycle.
    let still = ctx.aggregates.published_rows(&def).unwrap();
    assert_eq!(still.len(), 2);

    engine.recompute(&def).await.unwrap();
    let after = ctx.aggregates.published_rows(&def).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].value("revenue"), Some(100.0));
}

/// Downsampling defers a partition pinned by a live snapshot and picks it
/// up on the next pass once the snapshot is released.
#[tokio::test]
async fn downsample_defers_pinned_partition() {
    let ctx = TestContext::new();

    let old_ts = Granularity::Hour.truncate(Utc::now() - Duration::days(70));
    ctx.base
        .append(
            StreamKind::Events,
            fixtures::stored_events_at(old_ts, 10, EventType::PageView, 0.0),
        )
        .await
        .unwrap();

    let retention = RetentionWorker::new(
        ctx.base.clone(),
        ctx.aggregates.clone(),
        ctx.registry.clone(),
        RetentionConfig {
            events: RetentionPolicy::downsample_then_delete(30 * 24, 365 * 24),
            orders: RetentionPolicy::delete_after(365 * 24),
        },
    );

    let snapshot = ctx.base.snapshot(StreamKind::Events, None).await.unwrap();
    let report = retention.run().await.unwrap();
    assert_eq!(report.partitions_deferred, 1);
    assert_eq!(report.partitions_downsampled, 0);

    let metas = ctx.base.partitions(StreamKind::Events).await.unwrap();
    assert!(!metas[0].downsampled, "pinned partition must stay raw");

    drop(snapshot);
    let report = retention.run().await.unwrap();
    assert_eq!(report.partitions_deferred, 0);
    assert_eq!(report.partitions_downsampled, 1);
    assert!(report.summary_rows_written > 0);

    let metas = ctx.base.partitions(StreamKind::Events).await.unwrap();
    assert!(metas[0].downsampled);
}

/// A scheduled aggregate recomputed over downsampled partitions reports
/// the same totals as before downsampling.
#[tokio::test]
async fn downsampling_preserves_recomputed_totals() {
    let ctx = TestContext::with_definitions(vec![hourly_stats_definition()]);
    let def = ctx.registry.get("hourly_event_type_stats").unwrap().clone();
    let engine = RecomputeEngine::new(ctx.base.clone(), ctx.aggregates.clone());

    let old_ts =
        Granularity::Hour.truncate(Utc::now() - Duration::days(70)) + Duration::minutes(10);
    let mut rows = fixtures::stored_events_at(old_ts, 20, EventType::PageView, 0.0);
    rows.extend(fixtures::stored_events_at(
        old_ts + Duration::minutes(5),
        5,
        EventType::Purchase,
        10.0,
    ));
    ctx.base.append(StreamKind::Events, rows).await.unwrap();

    engine.recompute(&def).await.unwrap();
    let before = ctx.aggregates.published_rows(&def).unwrap();
    assert_eq!(before.len(), 2);

    let retention = RetentionWorker::new(
        ctx.base.clone(),
        ctx.aggregates.clone(),
        ctx.registry.clone(),
        RetentionConfig {
            events: RetentionPolicy::downsample_then_delete(30 * 24, 90 * 24),
            orders: RetentionPolicy::delete_after(365 * 24),
        },
    );
    let report = retention.run().await.unwrap();
    assert_eq!(report.partitions_downsampled, 1);

    engine.recompute(&def).await.unwrap();
    let after = ctx.aggregates.published_rows(&def).unwrap();

    // Sum/count totals survive exactly; the distinct-user sketches are
    // rebuilt from the same ids and estimate identically.
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.group, a.group);
        assert_eq!(b.value("event_count"), a.value("event_count"));
        assert_eq!(b.value("total_revenue"), a.value("total_revenue"));
        assert_eq!(b.value("unique_users"), a.value("unique_users"));
    }
}
