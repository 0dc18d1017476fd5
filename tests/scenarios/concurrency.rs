//! Test: Concurrency - many items, bounded workers, per-item ordering

use crate::helpers::*;
use pipe::core::{async_step_fn, StateTag, TransitionTable};
use pipe::execution::{Pipeline, SchedulingStrategy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Every item's transitions reach listeners in the order they happened
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_items_keep_per_item_order() {
    let pipeline = Pipeline::<i64>::builder("busy")
        .step(
            "yield",
            async_step_fn(|x: i64| async move {
                tokio::task::yield_now().await;
                Ok(x + 1)
            }),
        )
        .step_with_attempts(
            "odd_retry",
            2,
            async_step_fn(|x: i64| async move {
                if x % 7 == 0 {
                    anyhow::bail!("multiple of seven");
                }
                Ok(x)
            }),
        )
        .strategy(SchedulingStrategy::Parallel)
        .build()
        .unwrap();
    let recorder = RecordingListener::new();
    pipeline.register(recorder.clone()).unwrap();

    let ids: Vec<_> = (0..200).map(|i| pipeline.submit(i)).collect();
    let summary = tokio::time::timeout(Duration::from_secs(30), pipeline.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.driven, 200);
    assert_eq!(summary.succeeded + summary.failed, 200);

    let table = TransitionTable::with_retries();
    let mut per_item: HashMap<_, Vec<_>> = HashMap::new();
    for observed in recorder.all() {
        per_item.entry(observed.identity).or_default().push(observed);
    }
    assert_eq!(per_item.len(), 200);

    for id in ids {
        let observed = &per_item[&id];
        // Each delivery extends the previous one by exactly one state
        for (n, o) in observed.iter().enumerate() {
            assert_eq!(o.path.len(), n + 2, "item {} saw a transition out of order", id);
            assert!(table.is_legal(o.from, o.to));
        }
        let last = observed.last().unwrap();
        assert!(last.to.is_terminal());
        assert!(table.is_valid_walk(&last.path));
        assert_eq!(last.path, pipeline.status_of(id).unwrap().path());
    }
}

/// LimitedParallel(n) never drives more than n items at once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limited_parallelism() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let step = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        async_step_fn(move |x: i64| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(x)
            }
        })
    };

    let pipeline = Pipeline::<i64>::builder("limited")
        .step("measure", step)
        .strategy(SchedulingStrategy::LimitedParallel(2))
        .build()
        .unwrap();
    for i in 0..12 {
        pipeline.submit(i);
    }
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.succeeded, 12);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

/// Sequential runs drive items one at a time in submission order
#[tokio::test]
async fn test_sequential_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let step = {
        let order = Arc::clone(&order);
        async_step_fn(move |x: i64| {
            let order = Arc::clone(&order);
            async move {
                tokio::task::yield_now().await;
                order.lock().unwrap().push(x);
                Ok(x)
            }
        })
    };
    let pipeline = Pipeline::<i64>::builder("sequential")
        .step("record", step)
        .strategy(SchedulingStrategy::Sequential)
        .build()
        .unwrap();
    for i in 0..5 {
        pipeline.submit(i);
    }
    pipeline.run().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

/// Cancelling from another task races cleanly with the worker
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancels_end_in_valid_states() {
    let pipeline = Pipeline::<i64>::builder("racy")
        .step(
            "a",
            async_step_fn(|x: i64| async move {
                tokio::task::yield_now().await;
                Ok(x + 1)
            }),
        )
        .step(
            "b",
            async_step_fn(|x: i64| async move {
                tokio::task::yield_now().await;
                Ok(x + 1)
            }),
        )
        .strategy(SchedulingStrategy::Parallel)
        .build()
        .unwrap();
    let recorder = RecordingListener::new();
    pipeline.register(recorder.clone()).unwrap();

    let ids: Vec<_> = (0..100).map(|i| pipeline.submit(i)).collect();
    let run = pipeline.start().unwrap();
    for id in ids.iter().step_by(2) {
        pipeline.cancel(*id).unwrap();
    }
    let summary = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.succeeded + stats.cancelled, 100);
    assert_eq!(summary.failed, 0);

    for id in ids {
        let state = pipeline.status_of(id).unwrap();
        assert!(matches!(state.tag(), StateTag::Succeeded | StateTag::Cancelled));
        let transitions = recorder.transitions_of(id);
        assert_eq!(transitions.last().unwrap().1, state.tag());
        assert_eq!(transitions.len(), state.transition_count());
    }
}
