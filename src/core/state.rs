//! Item lifecycle states and the transition table they follow

use crate::core::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Lifecycle stage of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateTag {
    /// Admitted, not yet picked up by a worker
    Scheduled,
    /// A worker is driving the item through the chain
    Running,
    /// A step attempt failed and another attempt is pending
    Retrying,
    /// Every step completed
    Succeeded,
    /// A step failed with no attempts left
    Failed,
    /// Cancelled before reaching the end of the chain
    Cancelled,
}

impl StateTag {
    /// Check if no further transition can leave this tag
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateTag::Succeeded | StateTag::Failed | StateTag::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StateTag::Scheduled => "Scheduled",
            StateTag::Running => "Running",
            StateTag::Retrying => "Retrying",
            StateTag::Succeeded => "Succeeded",
            StateTag::Failed => "Failed",
            StateTag::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STANDARD_EDGES: &[(StateTag, StateTag)] = &[
    (StateTag::Scheduled, StateTag::Running),
    (StateTag::Running, StateTag::Succeeded),
    (StateTag::Running, StateTag::Failed),
    (StateTag::Scheduled, StateTag::Cancelled),
    (StateTag::Running, StateTag::Cancelled),
];

const RETRY_EDGES: &[(StateTag, StateTag)] = &[
    (StateTag::Running, StateTag::Retrying),
    (StateTag::Retrying, StateTag::Running),
    (StateTag::Retrying, StateTag::Cancelled),
];

/// The set of legal `(from, to)` tag pairs
///
/// Every table contains the standard edges. Extra edges may be added, but
/// never out of a terminal tag nor back into `Scheduled`, so `Scheduled`
/// stays the single entry point and terminal tags stay final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable {
    edges: Cow<'static, [(StateTag, StateTag)]>,
}

impl TransitionTable {
    /// `Scheduled → Running → {Succeeded, Failed}`, plus cancellation from
    /// `Scheduled` or `Running`
    pub fn standard() -> Self {
        Self {
            edges: Cow::Borrowed(STANDARD_EDGES),
        }
    }

    /// The standard table plus the `Running ⇄ Retrying` loop used by steps
    /// with more than one attempt
    pub fn with_retries() -> Self {
        let mut edges = STANDARD_EDGES.to_vec();
        edges.extend_from_slice(RETRY_EDGES);
        Self {
            edges: Cow::Owned(edges),
        }
    }

    /// Add an edge to the table
    pub fn allow(mut self, from: StateTag, to: StateTag) -> Result<Self> {
        if from.is_terminal() || to == StateTag::Scheduled || from == to {
            return Err(PipelineError::IllegalTransition { from, to });
        }
        if !self.is_legal(from, to) {
            self.edges.to_mut().push((from, to));
        }
        Ok(self)
    }

    pub fn is_legal(&self, from: StateTag, to: StateTag) -> bool {
        self.edges.iter().any(|&(f, t)| f == from && t == to)
    }

    /// Tags reachable from `from` in one transition
    pub fn successors(&self, from: StateTag) -> impl Iterator<Item = StateTag> + '_ {
        self.edges
            .iter()
            .filter(move |(f, _)| *f == from)
            .map(|(_, t)| *t)
    }

    /// Check that `path` is a walk of this table starting at `Scheduled`
    pub fn is_valid_walk(&self, path: &[StateTag]) -> bool {
        match path.first() {
            Some(StateTag::Scheduled) => path.windows(2).all(|w| self.is_legal(w[0], w[1])),
            _ => false,
        }
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Why a step attempt failed, preserved on the resulting state
#[derive(Debug)]
pub struct StepFailure {
    pub step: String,
    pub attempt: usize,
    pub max_attempts: usize,
    cause: anyhow::Error,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, attempt: usize, max_attempts: usize, cause: anyhow::Error) -> Self {
        Self {
            step: step.into(),
            attempt,
            max_attempts,
            cause,
        }
    }

    /// The error raised by the step
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step '{}' failed on attempt {}/{}: {}",
            self.step, self.attempt, self.max_attempts, self.cause
        )
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

/// Immutable snapshot of where an item sits in its lifecycle
///
/// A transition builds a new `State` pointing at the one it left, so the
/// predecessor chain is the item's full history.
#[derive(Clone)]
pub struct State {
    tag: StateTag,
    previous: Option<Arc<State>>,
    failure: Option<Arc<StepFailure>>,
    entered_at: DateTime<Utc>,
    transitions: usize,
}

impl State {
    /// The canonical starting state
    pub fn initial() -> Self {
        Self {
            tag: StateTag::Scheduled,
            previous: None,
            failure: None,
            entered_at: Utc::now(),
            transitions: 0,
        }
    }

    /// Transition under the standard table
    pub fn advance(&self, to: StateTag) -> Result<State> {
        self.advance_within(&TransitionTable::standard(), to)
    }

    /// Transition under the given table
    pub fn advance_within(&self, table: &TransitionTable, to: StateTag) -> Result<State> {
        if !table.is_legal(self.tag, to) {
            return Err(PipelineError::IllegalTransition { from: self.tag, to });
        }

        Ok(State {
            tag: to,
            previous: Some(Arc::new(self.clone())),
            failure: None,
            entered_at: Utc::now(),
            transitions: self.transitions + 1,
        })
    }

    /// Attach the failure that caused this state. Only used on a state that
    /// has not been published yet.
    pub(crate) fn with_failure(mut self, failure: Option<Arc<StepFailure>>) -> Self {
        self.failure = failure;
        self
    }

    pub fn tag(&self) -> StateTag {
        self.tag
    }

    pub fn is_terminal(&self) -> bool {
        self.tag.is_terminal()
    }

    /// The state this one transitioned from
    pub fn previous(&self) -> Option<&State> {
        self.previous.as_deref()
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_deref()
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Number of transitions between the initial state and this one
    pub fn transition_count(&self) -> usize {
        self.transitions
    }

    /// This state and its predecessors, newest first
    pub fn history(&self) -> impl Iterator<Item = &State> {
        std::iter::successors(Some(self), |state| state.previous())
    }

    /// Tags from the initial state up to this one
    pub fn path(&self) -> Vec<StateTag> {
        let mut tags: Vec<StateTag> = self.history().map(State::tag).collect();
        tags.reverse();
        tags
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("tag", &self.tag)
            .field("previous", &self.previous.as_ref().map(|p| p.tag))
            .field("failure", &self.failure.as_ref().map(|e| e.to_string()))
            .field("transitions", &self.transitions)
            .finish()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            Some(failure) => write!(f, "{}({})", self.tag, failure),
            None => write!(f, "{}", self.tag),
        }
    }
}
