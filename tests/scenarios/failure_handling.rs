//! Test: Failure Handling - a failing step ends the item

use crate::helpers::*;
use pipe::core::{step_fn, PipelineError, StateTag};
use pipe::execution::{Pipeline, SchedulingStrategy};
use std::error::Error;

/// alwaysFails then increment: the item fails and increment never runs
#[tokio::test]
async fn test_failure_stops_the_chain() {
    let (increment, increment_calls) = counted(|x| Ok(x + 1));
    let pipeline = Pipeline::<i64>::builder("failing")
        .step(
            "always_fails",
            step_fn(|_: i64| -> anyhow::Result<i64> { anyhow::bail!("boom") }),
        )
        .step("increment", increment)
        .build()
        .unwrap();
    let recorder = RecordingListener::new();
    pipeline.register(recorder.clone()).unwrap();

    let id = pipeline.submit(5);
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert!(!summary.all_succeeded());
    assert_eq!(calls(&increment_calls), 0);

    let state = pipeline.status_of(id).unwrap();
    assert_eq!(state.tag(), StateTag::Failed);
    assert_eq!(
        recorder.transitions_of(id),
        vec![
            (StateTag::Scheduled, StateTag::Running),
            (StateTag::Running, StateTag::Failed),
        ]
    );

    match pipeline.result(id) {
        Err(PipelineError::NotSucceeded(state)) => assert_eq!(state.tag(), StateTag::Failed),
        other => panic!("expected NotSucceeded, got {:?}", other),
    }
}

/// The failure carries the step name and the step's own error
#[tokio::test]
async fn test_failure_context() {
    let pipeline = Pipeline::<i64>::builder("failing")
        .step("ok", step_fn(|x: i64| Ok(x)))
        .step(
            "reject",
            step_fn(|x: i64| -> anyhow::Result<i64> { anyhow::bail!("rejected {}", x) }),
        )
        .build()
        .unwrap();

    let id = pipeline.submit(9);
    pipeline.run().await.unwrap();

    let state = pipeline.status_of(id).unwrap();
    let failure = state.failure().expect("failed state carries its failure");
    assert_eq!(failure.step, "reject");
    assert_eq!(failure.attempt, 1);
    assert_eq!(failure.cause().to_string(), "rejected 9");
    assert_eq!(failure.source().unwrap().to_string(), "rejected 9");

    let snapshot = pipeline.snapshot(id).unwrap();
    assert_eq!(snapshot.completed_steps, 1);
    assert_eq!(snapshot.total_steps, 2);
}

/// One item failing does not affect the others
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_are_item_local() {
    let pipeline = Pipeline::<i64>::builder("mixed")
        .step(
            "odd_only",
            step_fn(|x: i64| {
                if x % 2 == 0 {
                    anyhow::bail!("{} is even", x);
                }
                Ok(x)
            }),
        )
        .step("square", step_fn(|x: i64| Ok(x * x)))
        .strategy(SchedulingStrategy::LimitedParallel(3))
        .build()
        .unwrap();

    let ids: Vec<_> = (0..20).map(|i| (i, pipeline.submit(i))).collect();
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.failed, 10);
    for (input, id) in ids {
        if input % 2 == 0 {
            assert_eq!(pipeline.status_of(id).unwrap().tag(), StateTag::Failed);
        } else {
            assert_eq!(pipeline.result(id).unwrap(), input * input);
        }
    }
}

/// A panicking step fails its item instead of losing it
#[tokio::test]
async fn test_step_panic_fails_item() {
    let pipeline = Pipeline::<i64>::builder("panicky")
        .step(
            "explode",
            step_fn(|x: i64| -> anyhow::Result<i64> {
                if x == 13 {
                    panic!("unlucky");
                }
                Ok(x)
            }),
        )
        .build()
        .unwrap();

    let unlucky = pipeline.submit(13);
    let fine = pipeline.submit(7);
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(pipeline.status_of(unlucky).unwrap().tag(), StateTag::Failed);
    assert_eq!(pipeline.result(fine).unwrap(), 7);
    assert_eq!(pipeline.stats().in_flight, 0);
}
