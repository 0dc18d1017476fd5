//! Test: Success Chain - every step applied in order

use crate::helpers::*;
use pipe::core::{async_step_fn, step_fn, StateTag};
use pipe::execution::{Pipeline, SchedulingStrategy};

/// increment then double turns 3 into 8 and reports exactly two transitions
#[tokio::test]
async fn test_increment_then_double() {
    let pipeline = Pipeline::<i64>::builder("arith")
        .step("increment", step_fn(|x: i64| Ok(x + 1)))
        .step("double", step_fn(|x: i64| Ok(x * 2)))
        .build()
        .unwrap();
    let recorder = RecordingListener::new();
    pipeline.register(recorder.clone()).unwrap();

    let id = pipeline.submit(3);
    assert_eq!(pipeline.status_of(id).unwrap().tag(), StateTag::Scheduled);

    let summary = pipeline.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(pipeline.result(id).unwrap(), 8);

    assert_eq!(
        recorder.transitions_of(id),
        vec![
            (StateTag::Scheduled, StateTag::Running),
            (StateTag::Running, StateTag::Succeeded),
        ]
    );

    let state = pipeline.status_of(id).unwrap();
    assert!(state.is_terminal());
    assert_eq!(state.transition_count(), 2);
    assert_eq!(
        state.path(),
        vec![StateTag::Scheduled, StateTag::Running, StateTag::Succeeded]
    );
}

/// Steps see the output of the previous step, not the original input
#[tokio::test]
async fn test_order_is_respected() {
    let pipeline = Pipeline::<String>::builder("strings")
        .step("a", step_fn(|s: String| Ok(format!("{}a", s))))
        .step(
            "b",
            async_step_fn(|s: String| async move {
                tokio::task::yield_now().await;
                Ok(format!("{}b", s))
            }),
        )
        .step("c", step_fn(|s: String| Ok(format!("{}c", s))))
        .build()
        .unwrap();

    let id = pipeline.submit(">".to_string());
    pipeline.run().await.unwrap();
    assert_eq!(pipeline.result(id).unwrap(), ">abc");
}

/// An empty chain succeeds immediately with the input unchanged
#[tokio::test]
async fn test_empty_chain() {
    let pipeline = Pipeline::<i64>::builder("empty").build().unwrap();
    let id = pipeline.submit(42);
    pipeline.run().await.unwrap();
    assert_eq!(pipeline.result(id).unwrap(), 42);
}

/// Every step runs exactly once per item
#[tokio::test]
async fn test_each_step_invoked_once_per_item() {
    let (increment, increment_calls) = counted(|x| Ok(x + 1));
    let (double, double_calls) = counted(|x| Ok(x * 2));
    let pipeline = Pipeline::<i64>::builder("counted")
        .step("increment", increment)
        .step("double", double)
        .strategy(SchedulingStrategy::Parallel)
        .build()
        .unwrap();

    let ids: Vec<_> = (0..10).map(|i| pipeline.submit(i)).collect();
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.driven, 10);
    assert_eq!(calls(&increment_calls), 10);
    assert_eq!(calls(&double_calls), 10);
    for (i, id) in ids.into_iter().enumerate() {
        assert_eq!(pipeline.result(id).unwrap(), (i as i64 + 1) * 2);
    }
}
