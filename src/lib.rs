//! pipe - an in-process pipeline execution engine
//!
//! Values are submitted to a [`Pipeline`], given an [`Identity`], and moved
//! through an ordered chain of [`Step`]s by a pool of tokio workers. Every
//! state change is reported to the registered [`StateChangeListener`]s.

pub mod cli;
pub mod core;
pub mod execution;

// Re-export commonly used types
pub use crate::core::{
    aggregate_fn, async_step_fn, blocking_step_fn, step_fn, Aggregate, EngineConfig, Identity,
    LoggingListener, PipelineError, State, StateChangeListener, StateTag, Step, StepFailure,
    TransitionTable,
};
pub use crate::execution::{
    Aggregator, CountedBarrier, ManualBarrier, Pipeline, PipelineBuilder, PipelineStats,
    RunSummary, SchedulingStrategy,
};
