//! Listener registration and transition fan-out

use crate::core::{Identity, PipelineError, Result, State, StateChangeListener};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{error, warn};

/// An immutable set of listeners, cheap to clone and read without locking
#[derive(Clone)]
pub struct ListenerSet {
    listeners: Arc<[Arc<dyn StateChangeListener>]>,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ListenerSet {
    fn new(listeners: Vec<Arc<dyn StateChangeListener>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver one transition to every listener, in registration order.
    /// Returns how many listeners failed.
    pub fn dispatch(&self, identity: Identity, previous: &State, new: &State) -> usize {
        let mut failures = 0;

        for listener in self.listeners.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_state_changed(identity, previous, new)
            }));

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(
                        "Listener failed for {} ({} -> {}): {:#}",
                        identity,
                        previous.tag(),
                        new.tag(),
                        e
                    );
                }
                Err(payload) => {
                    failures += 1;
                    error!(
                        "Listener panicked for {} ({} -> {}): {}",
                        identity,
                        previous.tag(),
                        new.tag(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        failures
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Collects listeners until the first run, then freezes them
///
/// Adding a listener while items are moving could make it miss earlier
/// transitions of in-flight items, so registration is closed once frozen.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    pending: Mutex<Vec<Arc<dyn StateChangeListener>>>,
    frozen: OnceLock<ListenerSet>,
}

impl ListenerRegistry {
    pub fn register(&self, listener: Arc<dyn StateChangeListener>) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.frozen.get().is_some() {
            return Err(PipelineError::IllegalState(
                "Listeners must be registered before the pipeline starts running".to_string(),
            ));
        }
        pending.push(listener);
        Ok(())
    }

    /// Close registration and return the final set
    pub fn freeze(&self) -> ListenerSet {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.frozen
            .get_or_init(|| ListenerSet::new(pending.clone()))
            .clone()
    }

    /// The frozen set, or the listeners registered so far
    pub fn current(&self) -> ListenerSet {
        match self.frozen.get() {
            Some(set) => set.clone(),
            None => ListenerSet::new(
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
        }
    }
}
