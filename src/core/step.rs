//! Step contract and chain descriptors

use crate::execution::aggregator::Aggregator;
use crate::execution::barrier::{CountedBarrier, ManualBarrier};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A transformation applied to one item's value
///
/// A step is shared by every item in the pipeline, so it must not keep
/// references to the values it is given. It may be invoked more than once
/// for the same item when its descriptor allows retries.
#[async_trait]
pub trait Step<T>: Send + Sync {
    async fn apply(&self, input: T) -> Result<T>;
}

/// Step backed by a synchronous closure
pub struct FnStep<F>(F);

#[async_trait]
impl<T, F> Step<T> for FnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<T> + Send + Sync,
{
    async fn apply(&self, input: T) -> Result<T> {
        (self.0)(input)
    }
}

/// Wrap a synchronous closure as a step
pub fn step_fn<T, F>(f: F) -> FnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<T> + Send + Sync,
{
    FnStep(f)
}

/// Step backed by a closure returning a future
pub struct AsyncFnStep<F>(F);

#[async_trait]
impl<T, F, Fut> Step<T> for AsyncFnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    async fn apply(&self, input: T) -> Result<T> {
        (self.0)(input).await
    }
}

/// Wrap an async closure as a step
pub fn async_step_fn<T, F, Fut>(f: F) -> AsyncFnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    AsyncFnStep(f)
}

/// Step whose closure blocks; it runs on tokio's blocking pool
pub struct BlockingFnStep<F>(Arc<F>);

#[async_trait]
impl<T, F> Step<T> for BlockingFnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<T> + Send + Sync + 'static,
{
    async fn apply(&self, input: T) -> Result<T> {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f(input))
            .await
            .map_err(|e| anyhow!("Blocking step did not complete: {}", e))?
    }
}

/// Wrap a blocking closure as a step
pub fn blocking_step_fn<T, F>(f: F) -> BlockingFnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<T> + Send + Sync + 'static,
{
    BlockingFnStep(Arc::new(f))
}

/// A transformation applied to a whole batch of values at once
///
/// Inputs arrive in admission order. The output must hold exactly one value
/// per input, in the same order; output `i` becomes the value of the item
/// that supplied input `i`.
#[async_trait]
pub trait Aggregate<T>: Send + Sync {
    async fn aggregate(&self, inputs: Vec<T>) -> Result<Vec<T>>;
}

/// Aggregation backed by a synchronous closure
pub struct FnAggregate<F>(F);

#[async_trait]
impl<T, F> Aggregate<T> for FnAggregate<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Result<Vec<T>> + Send + Sync,
{
    async fn aggregate(&self, inputs: Vec<T>) -> Result<Vec<T>> {
        (self.0)(inputs)
    }
}

/// Wrap a synchronous closure as an aggregation
pub fn aggregate_fn<T, F>(f: F) -> FnAggregate<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Result<Vec<T>> + Send + Sync,
{
    FnAggregate(f)
}

/// What occupies a chain position
pub(crate) enum StepKind<T> {
    Transform(Arc<dyn Step<T>>),
    Barrier(ManualBarrier),
    CountedBarrier(CountedBarrier),
    Aggregator(Aggregator<T>),
}

impl<T> StepKind<T> {
    fn as_str(&self) -> &'static str {
        match self {
            StepKind::Transform(_) => "transform",
            StepKind::Barrier(_) => "manual barrier",
            StepKind::CountedBarrier(_) => "counted barrier",
            StepKind::Aggregator(_) => "aggregator",
        }
    }
}

impl<T> Clone for StepKind<T> {
    fn clone(&self) -> Self {
        match self {
            StepKind::Transform(step) => StepKind::Transform(Arc::clone(step)),
            StepKind::Barrier(barrier) => StepKind::Barrier(barrier.clone()),
            StepKind::CountedBarrier(barrier) => StepKind::CountedBarrier(barrier.clone()),
            StepKind::Aggregator(aggregator) => StepKind::Aggregator(aggregator.clone()),
        }
    }
}

/// A named position in the step chain
pub struct StepDescriptor<T> {
    name: String,
    max_attempts: usize,
    pub(crate) kind: StepKind<T>,
}

impl<T: Send + 'static> StepDescriptor<T> {
    pub(crate) fn transform(name: String, max_attempts: usize, step: Arc<dyn Step<T>>) -> Self {
        Self {
            name,
            max_attempts,
            kind: StepKind::Transform(step),
        }
    }

    pub(crate) fn barrier(name: String, barrier: ManualBarrier) -> Self {
        Self {
            name,
            max_attempts: 1,
            kind: StepKind::Barrier(barrier),
        }
    }

    pub(crate) fn counted_barrier(name: String, barrier: CountedBarrier) -> Self {
        Self {
            name,
            max_attempts: 1,
            kind: StepKind::CountedBarrier(barrier),
        }
    }

    pub(crate) fn aggregator(name: String, max_attempts: usize, aggregator: Aggregator<T>) -> Self {
        Self {
            name,
            max_attempts,
            kind: StepKind::Aggregator(aggregator),
        }
    }
}

impl<T> StepDescriptor<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times the step may be invoked for one item
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// True for manual and counted barriers
    pub fn is_barrier(&self) -> bool {
        matches!(self.kind, StepKind::Barrier(_) | StepKind::CountedBarrier(_))
    }

    pub fn is_aggregator(&self) -> bool {
        matches!(self.kind, StepKind::Aggregator(_))
    }
}

impl<T> Clone for StepDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            max_attempts: self.max_attempts,
            kind: self.kind.clone(),
        }
    }
}

impl<T> fmt::Debug for StepDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("kind", &self.kind.as_str())
            .finish()
    }
}
