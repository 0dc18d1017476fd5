//! Test: Retry Behavior - steps with more than one attempt

use crate::helpers::*;
use pipe::core::{step_fn, Identity, PipelineError, State, StateTag, TransitionTable};
use pipe::execution::Pipeline;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A step that fails twice then succeeds is retried with the same input
#[tokio::test]
async fn test_retry_until_success() {
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let failures_left = Arc::new(AtomicUsize::new(2));
    let flaky = {
        let inputs = Arc::clone(&inputs);
        let failures_left = Arc::clone(&failures_left);
        step_fn(move |x: i64| {
            inputs.lock().unwrap().push(x);
            if failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("transient");
            }
            Ok(x * 10)
        })
    };

    let pipeline = Pipeline::<i64>::builder("retrying")
        .step("increment", step_fn(|x: i64| Ok(x + 1)))
        .step_with_attempts("flaky", 3, flaky)
        .build()
        .unwrap();
    let recorder = RecordingListener::new();
    pipeline.register(recorder.clone()).unwrap();

    let id = pipeline.submit(1);
    pipeline.run().await.unwrap();

    assert_eq!(pipeline.result(id).unwrap(), 20);
    assert_eq!(*inputs.lock().unwrap(), vec![2, 2, 2]);
    assert_eq!(
        pipeline.status_of(id).unwrap().path(),
        vec![
            StateTag::Scheduled,
            StateTag::Running,
            StateTag::Retrying,
            StateTag::Running,
            StateTag::Retrying,
            StateTag::Running,
            StateTag::Succeeded,
        ]
    );

    let retries: Vec<_> = recorder
        .all()
        .into_iter()
        .filter(|o| o.to == StateTag::Retrying)
        .collect();
    assert_eq!(retries.len(), 2);
}

/// Retrying states carry the failure of the attempt that caused them
#[tokio::test]
async fn test_retrying_state_carries_failure() {
    let pipeline = Pipeline::<i64>::builder("exhausted")
        .step_with_attempts(
            "stubborn",
            2,
            step_fn(|_: i64| -> anyhow::Result<i64> { anyhow::bail!("nope") }),
        )
        .build()
        .unwrap();

    let id = pipeline.submit(0);
    let summary = pipeline.run().await.unwrap();
    assert_eq!(summary.failed, 1);

    let state = pipeline.status_of(id).unwrap();
    assert_eq!(state.tag(), StateTag::Failed);
    let failure = state.failure().unwrap();
    assert_eq!((failure.attempt, failure.max_attempts), (2, 2));

    let retrying = state
        .history()
        .find(|s| s.tag() == StateTag::Retrying)
        .expect("one retry recorded");
    let first = retrying.failure().unwrap();
    assert_eq!(first.attempt, 1);
    assert_eq!(first.cause().to_string(), "nope");
}

/// Steps default to a single attempt
#[tokio::test]
async fn test_single_attempt_by_default() {
    let (step, step_calls) = counted(|_| anyhow::bail!("once"));
    let pipeline = Pipeline::<i64>::builder("once").step("s", step).build().unwrap();

    let id = pipeline.submit(0);
    pipeline.run().await.unwrap();

    assert_eq!(calls(&step_calls), 1);
    assert_eq!(
        pipeline.status_of(id).unwrap().path(),
        vec![StateTag::Scheduled, StateTag::Running, StateTag::Failed]
    );
}

/// A custom table must still allow the retry edges, including cancelling a
/// retrying item
#[test]
fn test_custom_table() {
    let partial = TransitionTable::standard()
        .allow(StateTag::Running, StateTag::Retrying)
        .unwrap()
        .allow(StateTag::Retrying, StateTag::Running)
        .unwrap();
    let rejected = Pipeline::<i64>::builder("partial")
        .step_with_attempts("s", 2, step_fn(|x: i64| Ok(x)))
        .transition_table(partial.clone())
        .build();
    assert!(matches!(
        rejected,
        Err(PipelineError::InvalidDefinition(msg)) if msg.contains("Retrying -> Cancelled")
    ));

    let complete = partial.allow(StateTag::Retrying, StateTag::Cancelled).unwrap();
    let pipeline = Pipeline::<i64>::builder("custom")
        .step_with_attempts("s", 2, step_fn(|x: i64| Ok(x)))
        .transition_table(complete)
        .build();
    assert!(pipeline.is_ok());

    assert!(TransitionTable::standard()
        .allow(StateTag::Succeeded, StateTag::Running)
        .is_err());
}

/// An item cancelled while waiting for its next attempt ends Cancelled
#[tokio::test]
async fn test_cancel_while_retrying() {
    let table = TransitionTable::standard()
        .allow(StateTag::Running, StateTag::Retrying)
        .unwrap()
        .allow(StateTag::Retrying, StateTag::Running)
        .unwrap()
        .allow(StateTag::Retrying, StateTag::Cancelled)
        .unwrap();
    let (stubborn, stubborn_calls) = counted(|_| anyhow::bail!("still down"));
    let pipeline = Pipeline::<i64>::builder("retry-cancel")
        .step_with_attempts("stubborn", 5, stubborn)
        .transition_table(table)
        .build()
        .unwrap();
    let canceller = {
        let pipeline = pipeline.clone();
        move |id: Identity, _: &State, new: &State| -> anyhow::Result<()> {
            if new.tag() == StateTag::Retrying {
                pipeline.cancel(id)?;
            }
            Ok(())
        }
    };
    pipeline.register(canceller).unwrap();

    let id = pipeline.submit(1);
    let summary = tokio::time::timeout(Duration::from_secs(5), pipeline.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.cancelled, 1);
    assert_eq!(calls(&stubborn_calls), 1);
    let state = pipeline.status_of(id).unwrap();
    assert!(state.is_terminal());
    assert_eq!(
        state.path(),
        vec![
            StateTag::Scheduled,
            StateTag::Running,
            StateTag::Retrying,
            StateTag::Cancelled,
        ]
    );
}
