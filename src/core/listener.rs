//! State change listener contract

use crate::core::{identity::Identity, state::{State, StateTag}};
use anyhow::Result;
use tracing::{debug, error, info};

/// Observer notified synchronously of every transition of every item
///
/// Calls for one identity arrive in the order the transitions happened.
/// An error or panic raised here is logged by the engine and otherwise
/// ignored; it never affects the item or the other listeners.
pub trait StateChangeListener: Send + Sync {
    fn on_state_changed(&self, identity: Identity, previous: &State, new: &State) -> Result<()>;
}

impl<F> StateChangeListener for F
where
    F: Fn(Identity, &State, &State) -> Result<()> + Send + Sync,
{
    fn on_state_changed(&self, identity: Identity, previous: &State, new: &State) -> Result<()> {
        self(identity, previous, new)
    }
}

/// Listener that reports transitions through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl StateChangeListener for LoggingListener {
    fn on_state_changed(&self, identity: Identity, previous: &State, new: &State) -> Result<()> {
        match new.tag() {
            StateTag::Failed => error!(
                "{} transitioned {} -> {}",
                identity,
                previous.tag(),
                new
            ),
            StateTag::Retrying => {
                info!("{} transitioned {} -> {}", identity, previous.tag(), new.tag());
                if let Some(failure) = new.failure() {
                    debug!("Retry cause for {}: {:?}", identity, failure.cause());
                }
            }
            _ => info!("{} transitioned {} -> {}", identity, previous.tag(), new.tag()),
        }
        Ok(())
    }
}
