//! Test: Manual Barriers - items wait until the barrier is lifted

use crate::helpers::*;
use pipe::core::{step_fn, StateTag};
use pipe::execution::{Pipeline, SchedulingStrategy};
use std::time::Duration;

#[tokio::test]
async fn test_items_wait_for_lift() {
    let (double, double_calls) = counted(|x| Ok(x * 2));
    let pipeline = Pipeline::<i64>::builder("gated")
        .step("increment", step_fn(|x: i64| Ok(x + 1)))
        .manual_barrier("release")
        .step("double", double)
        .strategy(SchedulingStrategy::Parallel)
        .build()
        .unwrap();
    let barrier = pipeline.manual_barrier("release").expect("barrier is declared");
    assert!(pipeline.manual_barrier("missing").is_none());

    let ids: Vec<_> = (1..=3).map(|i| pipeline.submit(i)).collect();
    let run = pipeline.start().unwrap();

    wait_until("all items at the barrier", || barrier.blocked_count() == 3).await;
    assert_eq!(calls(&double_calls), 0);
    for id in &ids {
        let snapshot = pipeline.snapshot(*id).unwrap();
        assert_eq!(snapshot.state.tag(), StateTag::Running);
        assert_eq!(snapshot.completed_steps, 1);
    }

    barrier.lift();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(calls(&double_calls), 3);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(pipeline.result(*id).unwrap(), (i as i64 + 2) * 2);
    }
    assert_eq!(barrier.blocked_count(), 0);
}

/// Items parked on a barrier can still be cancelled
#[tokio::test]
async fn test_cancel_parked_item() {
    let pipeline = Pipeline::<i64>::builder("gated")
        .manual_barrier("hold")
        .step("increment", step_fn(|x: i64| Ok(x + 1)))
        .strategy(SchedulingStrategy::Parallel)
        .build()
        .unwrap();
    let barrier = pipeline.manual_barrier("hold").unwrap();

    let parked = pipeline.submit(1);
    let released = pipeline.submit(2);
    let run = pipeline.start().unwrap();

    wait_until("both items parked", || barrier.blocked_count() == 2).await;
    pipeline.cancel(parked).unwrap();
    wait_until("cancelled item leaves the barrier", || barrier.blocked_count() == 1).await;
    assert_eq!(pipeline.status_of(parked).unwrap().tag(), StateTag::Cancelled);

    barrier.lift();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(pipeline.result(released).unwrap(), 3);
}

/// A lifted barrier lets later items through without waiting
#[tokio::test]
async fn test_lifted_barrier_stays_open() {
    let pipeline = Pipeline::<i64>::builder("open")
        .manual_barrier("gate")
        .build()
        .unwrap();
    pipeline.manual_barrier("gate").unwrap().lift();

    let id = pipeline.submit(5);
    tokio::time::timeout(Duration::from_secs(5), pipeline.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pipeline.result(id).unwrap(), 5);
}
