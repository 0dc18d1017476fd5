//! Core domain model
//!
//! Identities, lifecycle states, the step and listener contracts, engine
//! configuration and the error type shared by the rest of the crate.

pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod state;
pub mod step;

pub use config::{EngineConfig, StrategyKind};
pub use error::{PipelineError, Result};
pub use identity::Identity;
pub use listener::{LoggingListener, StateChangeListener};
pub use state::{State, StateTag, StepFailure, TransitionTable};
pub use step::{
    aggregate_fn, async_step_fn, blocking_step_fn, step_fn, Aggregate, Step, StepDescriptor,
};
