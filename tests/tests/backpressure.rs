//! Backpressure behavior of the ingestion sink.

use aggregate_store::BaseStore;
use integration_tests::{fixtures, setup::TestContext};
use rollup_core::{Error, EventType, StreamKind};

/// With a depth-1 queue and no workers draining, the second batch is
/// rejected with Overloaded and leaves no trace; once workers drain the
/// queue, ingestion resumes.
#[tokio::test]
async fn full_queue_rejects_until_drained() {
    let ctx = TestContext::with_queue_depth(1);

    let ts = fixtures::mid_hour_timestamp();
    let first = ctx
        .sink
        .ingest(
            StreamKind::Events,
            vec![fixtures::event_at(ts, 1, 1, EventType::PageView, 0.0)],
        )
        .await
        .unwrap();

    let err = ctx
        .sink
        .ingest(
            StreamKind::Events,
            vec![fixtures::event_at(ts, 2, 1, EventType::PageView, 0.0)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Overloaded(_)));

    // The rejected batch must not have been appended.
    let metas = ctx.base.partitions(StreamKind::Events).await.unwrap();
    assert_eq!(metas.iter().map(|m| m.rows).sum::<u64>(), 1);

    // Start workers; once every definition has applied the first batch,
    // all queues have room again.
    let _workers = ctx.start_workers();
    for def in ctx.registry.incremental_for(StreamKind::Events) {
        ctx.wait_for_watermark(&def.name, first).await;
    }

    let retry = ctx
        .sink
        .ingest(
            StreamKind::Events,
            vec![fixtures::event_at(ts, 2, 1, EventType::PageView, 0.0)],
        )
        .await;
    assert!(retry.is_ok());
}

/// Overload on one stream's queues does not reject the other stream.
#[tokio::test]
async fn streams_backpressure_independently() {
    let ctx = TestContext::with_queue_depth(1);
    let ts = fixtures::mid_hour_timestamp();

    ctx.sink
        .ingest(
            StreamKind::Events,
            vec![fixtures::event_at(ts, 1, 1, EventType::PageView, 0.0)],
        )
        .await
        .unwrap();
    let err = ctx
        .sink
        .ingest(
            StreamKind::Events,
            vec![fixtures::event_at(ts, 2, 1, EventType::PageView, 0.0)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Overloaded(_)));

    // Orders run through their own queue and still ingest.
    let order = fixtures::order_at(ts, 1, 10, 99.0, rollup_core::OrderStatus::Completed);
    assert!(ctx.sink.ingest(StreamKind::Orders, vec![order]).await.is_ok());
}
