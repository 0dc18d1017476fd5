//! Execution scheduler - admission queue and worker pool sizing

use crate::core::{Identity, PipelineError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Worker count used when nothing else is configured
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Strategy for scheduling item execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Drive one item at a time
    Sequential,

    /// Drive every admitted item concurrently
    Parallel,

    /// Limited parallelism (max N concurrent items)
    LimitedParallel(usize),
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::LimitedParallel(DEFAULT_MAX_WORKERS)
    }
}

impl SchedulingStrategy {
    /// Upper bound on concurrently driven items, `None` when unbounded
    pub fn max_workers(self) -> Option<usize> {
        match self {
            SchedulingStrategy::Sequential => Some(1),
            SchedulingStrategy::Parallel => None,
            SchedulingStrategy::LimitedParallel(max) => Some(max),
        }
    }
}

/// Queue of admitted items waiting for a worker, plus the worker permits
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
    queue: Mutex<VecDeque<Identity>>,
    wake: Notify,
    permits: Option<Arc<Semaphore>>,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Result<Self> {
        let permits = match strategy.max_workers() {
            Some(0) => {
                return Err(PipelineError::InvalidDefinition(
                    "Limited parallelism needs at least one worker".to_string(),
                ))
            }
            Some(n) => Some(Arc::new(Semaphore::new(n))),
            None => None,
        };

        Ok(Self {
            strategy,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            permits,
        })
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Add an item to the queue and wake the run loop
    pub fn enqueue(&self, identity: Identity) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(identity);
        self.wake.notify_one();
    }

    /// Take every queued item, oldest first
    pub fn next_batch(&self) -> Vec<Identity> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Check if there are queued items
    pub fn has_pending(&self) -> bool {
        !self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Wait until `enqueue` is called. A call made while nobody was waiting
    /// is remembered, so no wake-up is lost.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    /// Reserve a worker slot; `None` when the strategy is unbounded
    pub async fn acquire_worker(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.permits {
            Some(permits) => Arc::clone(permits)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| PipelineError::IllegalState("Worker pool was closed".to_string())),
            None => Ok(None),
        }
    }
}
