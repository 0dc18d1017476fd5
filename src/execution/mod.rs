//! Pipeline execution engine

pub mod aggregator;
pub mod barrier;
pub mod dispatch;
pub mod engine;
pub(crate) mod executor;
pub(crate) mod registry;
pub mod scheduler;

pub use aggregator::Aggregator;
pub use barrier::{CountedBarrier, ManualBarrier};
pub use dispatch::ListenerSet;
pub use engine::{ItemSnapshot, Pipeline, PipelineBuilder, PipelineStats, RunSummary};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
