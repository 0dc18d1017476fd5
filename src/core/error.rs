//! Engine error types

use crate::core::{identity::Identity, state::{State, StateTag}};
use thiserror::Error;

/// Errors surfaced to the host by pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A state change outside the transition table was attempted
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: StateTag, to: StateTag },

    /// The identity was never returned by `submit` on this pipeline
    #[error("Unknown identity: {0}")]
    UnknownIdentity(Identity),

    /// A result was requested for an item that did not succeed
    #[error("Item has not succeeded (state: {0})")]
    NotSucceeded(State),

    /// The operation is not allowed in the pipeline's current phase
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The pipeline definition is inconsistent
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
