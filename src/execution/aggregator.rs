//! Aggregators - chain positions that process items as one batch
//!
//! Items arriving at an aggregator are held until `capacity` items are
//! accounted for, either by arriving or by ending earlier in the chain. The
//! held values then go through the aggregation together, in admission order,
//! and every item continues with its own output.
//!
//! When the aggregation fails, every item of the batch gets the failure and
//! may arrive again if its attempts allow. After one successful batch the
//! aggregator is spent and rejects further arrivals.

use crate::core::{Aggregate, PipelineError, Result};
use anyhow::anyhow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What one attempt at a chain position produced
pub(crate) enum Attempt<T> {
    Done(T),
    Failed(anyhow::Error),
    /// Cancelled while held; the item now counts as absent
    Withdrawn,
}

type Shared<T> = std::result::Result<T, Arc<anyhow::Error>>;

struct Batch<T> {
    capacity: usize,
    absent: usize,
    /// Held values keyed by admission position
    waiting: BTreeMap<u64, T>,
    processing: bool,
    released: bool,
    outcomes: HashMap<u64, Shared<T>>,
}

impl<T> Batch<T> {
    fn accounted(&self) -> usize {
        self.waiting.len() + self.absent
    }

    fn is_ready(&self) -> bool {
        !self.processing
            && !self.released
            && !self.waiting.is_empty()
            && self.accounted() >= self.capacity
    }
}

struct AggregatorInner<T> {
    batch: Mutex<Batch<T>>,
    changed: watch::Sender<u64>,
    action: Arc<dyn Aggregate<T>>,
}

/// Handle to an aggregator position. Clones share the same aggregator.
pub struct Aggregator<T> {
    inner: Arc<AggregatorInner<T>>,
}

impl<T> Clone for Aggregator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Aggregator<T> {
    pub(crate) fn new(capacity: usize, action: Arc<dyn Aggregate<T>>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(AggregatorInner {
                batch: Mutex::new(Batch {
                    capacity,
                    absent: 0,
                    waiting: BTreeMap::new(),
                    processing: false,
                    released: false,
                    outcomes: HashMap::new(),
                }),
                changed,
                action,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Batch<T>> {
        self.inner.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Items currently held
    pub fn arrivals(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Items that ended before reaching the aggregator
    pub fn absentees(&self) -> usize {
        self.lock().absent
    }

    /// True once a batch went through successfully
    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Change how many items make up the batch
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        {
            let mut batch = self.lock();
            if batch.released || batch.processing {
                return Err(PipelineError::IllegalState(
                    "Cannot change the capacity once the batch was taken".to_string(),
                ));
            }
            if capacity == 0 || capacity < batch.accounted() {
                return Err(PipelineError::IllegalState(format!(
                    "Cannot change the capacity from {} to {}: {} items are already accounted for",
                    batch.capacity,
                    capacity,
                    batch.accounted()
                )));
            }
            batch.capacity = capacity;
        }
        // A held item starts the batch if it is now complete
        self.notify();
        Ok(())
    }

    /// Account for an item that will never arrive
    pub(crate) fn mark_absent(&self) {
        {
            let mut batch = self.lock();
            if batch.released {
                return;
            }
            batch.absent += 1;
        }
        self.notify();
    }

    /// Hand over a value and wait for its share of the batch output
    ///
    /// Cancellation is honoured while the value is held. Once the batch was
    /// taken for processing the item waits for its output.
    pub(crate) async fn push(
        &self,
        position: u64,
        input: T,
        cancel: &CancellationToken,
    ) -> Attempt<T> {
        let mut changed = self.inner.changed.subscribe();
        {
            let mut batch = self.lock();
            if batch.released || batch.processing || batch.accounted() >= batch.capacity {
                return Attempt::Failed(anyhow!(
                    "Aggregator is full: its batch takes {} items",
                    batch.capacity
                ));
            }
            batch.waiting.insert(position, input);
        }

        let mut withdrawable = true;
        loop {
            {
                let mut batch = self.lock();
                if let Some(outcome) = batch.outcomes.remove(&position) {
                    return match outcome {
                        Ok(output) => Attempt::Done(output),
                        Err(cause) => Attempt::Failed(anyhow!("{:#}", cause)),
                    };
                }
                if batch.is_ready() {
                    self.launch(&mut batch);
                }
            }

            tokio::select! {
                _ = changed.changed() => {}
                _ = cancel.cancelled(), if withdrawable => {
                    if self.withdraw(position) {
                        return Attempt::Withdrawn;
                    }
                    withdrawable = false;
                }
            }
        }
    }

    fn withdraw(&self, position: u64) -> bool {
        let withdrawn = {
            let mut batch = self.lock();
            let withdrawn = batch.waiting.remove(&position).is_some();
            if withdrawn {
                batch.absent += 1;
            }
            withdrawn
        };
        if withdrawn {
            self.notify();
        }
        withdrawn
    }

    /// Take the held values and process them on their own task, so the
    /// batch completes even if the item that started it goes away
    fn launch(&self, batch: &mut Batch<T>) {
        batch.processing = true;
        let (positions, inputs): (Vec<u64>, Vec<T>) =
            std::mem::take(&mut batch.waiting).into_iter().unzip();
        debug!("Aggregating a batch of {} items", inputs.len());

        let aggregator = self.clone();
        tokio::spawn(async move { aggregator.process(positions, inputs).await });
    }

    async fn process(self, positions: Vec<u64>, inputs: Vec<T>) {
        let expected = inputs.len();
        let action = Arc::clone(&self.inner.action);
        // A separate task turns a panicking aggregation into an error
        let joined = tokio::spawn(async move { action.aggregate(inputs).await }).await;

        let outcome = match joined {
            Ok(Ok(outputs)) if outputs.len() == expected => Ok(outputs),
            Ok(Ok(outputs)) => Err(anyhow!(
                "Aggregation returned {} values for {} items",
                outputs.len(),
                expected
            )),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow!("Aggregation did not complete: {}", e)),
        };

        {
            let mut batch = self.lock();
            batch.processing = false;
            match outcome {
                Ok(outputs) => {
                    batch.released = true;
                    batch
                        .outcomes
                        .extend(positions.into_iter().zip(outputs.into_iter().map(Ok)));
                }
                Err(e) => {
                    warn!("Aggregation of {} items failed: {:#}", expected, e);
                    let cause = Arc::new(e);
                    batch
                        .outcomes
                        .extend(positions.into_iter().map(|p| (p, Err(Arc::clone(&cause)))));
                }
            }
        }
        self.notify();
    }
}

impl<T> fmt::Debug for Aggregator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let batch = self.inner.batch.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Aggregator")
            .field("capacity", &batch.capacity)
            .field("waiting", &batch.waiting.len())
            .field("absent", &batch.absent)
            .field("released", &batch.released)
            .finish()
    }
}
