//! Item executor - walks one item through the step chain

use crate::core::step::StepKind;
use crate::core::{PipelineError, Result, StateTag, StepDescriptor, StepFailure, TransitionTable};
use crate::execution::aggregator::Attempt;
use crate::execution::barrier::Passage;
use crate::execution::dispatch::ListenerSet;
use crate::execution::registry::{ItemRecord, ItemRegistry, ItemSlot};
use anyhow::anyhow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters updated on every transition into a terminal state
#[derive(Debug, Default)]
pub(crate) struct Outcomes {
    pub succeeded: AtomicUsize,
    pub failed: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub listener_failures: AtomicUsize,
}

impl Outcomes {
    fn record(&self, tag: StateTag) {
        let counter = match tag {
            StateTag::Succeeded => &self.succeeded,
            StateTag::Failed => &self.failed,
            StateTag::Cancelled => &self.cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a transition touches besides the item itself
pub(crate) struct Transitions<'a> {
    pub table: &'a TransitionTable,
    pub listeners: &'a ListenerSet,
    pub outcomes: &'a Outcomes,
}

type Decision = Option<(StateTag, Option<Arc<StepFailure>>)>;

impl Transitions<'_> {
    /// Move an item to `to` and tell the listeners about it
    pub fn apply<T>(
        &self,
        slot: &ItemSlot<T>,
        to: StateTag,
        failure: Option<Arc<StepFailure>>,
    ) -> Result<()> {
        self.apply_when(slot, |_| Some((to, failure))).map(|_| ())
    }

    /// Let `decide` pick the next state from the item's record, then tell
    /// the listeners. Returns the tag moved to, `None` when `decide` passed.
    ///
    /// The delivery lock is held until every listener returned, so one
    /// item's transitions are seen one at a time and in order. The record
    /// lock is released before the first listener runs, so a listener may
    /// query or cancel the item it is told about.
    pub fn apply_when<T, F>(&self, slot: &ItemSlot<T>, decide: F) -> Result<Option<StateTag>>
    where
        F: FnOnce(&ItemRecord<T>) -> Decision,
    {
        let _delivery = slot.delivery();
        let (previous, next) = {
            let mut record = slot.lock();
            let Some((to, failure)) = decide(&*record) else {
                return Ok(None);
            };
            let next = record.state.advance_within(self.table, to)?.with_failure(failure);
            let previous = std::mem::replace(&mut record.state, next.clone());
            (previous, next)
        };

        debug!("Item {}: {} -> {}", slot.identity.short(), previous.tag(), next.tag());
        self.outcomes.record(next.tag());

        let failed = self.listeners.dispatch(slot.identity, &previous, &next);
        if failed > 0 {
            self.outcomes.listener_failures.fetch_add(failed, Ordering::SeqCst);
        }
        Ok(Some(next.tag()))
    }
}

/// Count an item that will never reach chain positions `from..` as absent
/// at every counted barrier and aggregator among them
pub(crate) fn mark_absent_from<T: Clone + Send + Sync + 'static>(steps: &[StepDescriptor<T>], from: usize) {
    for descriptor in steps.iter().skip(from) {
        match &descriptor.kind {
            StepKind::CountedBarrier(barrier) => barrier.mark_absent(),
            StepKind::Aggregator(aggregator) => aggregator.mark_absent(),
            StepKind::Transform(_) | StepKind::Barrier(_) => {}
        }
    }
}

/// How a traversal ended. `next` is the first chain position the item
/// never reached.
enum Outcome {
    Succeeded,
    Failed { failure: Arc<StepFailure>, next: usize },
    Cancelled { next: usize },
}

/// Drives admitted items through the chain
pub(crate) struct ItemExecutor<T> {
    steps: Arc<[StepDescriptor<T>]>,
    table: TransitionTable,
    registry: Arc<ItemRegistry<T>>,
    listeners: ListenerSet,
    outcomes: Arc<Outcomes>,
}

impl<T: Clone + Send + Sync + 'static> ItemExecutor<T> {
    pub fn new(
        steps: Arc<[StepDescriptor<T>]>,
        table: TransitionTable,
        registry: Arc<ItemRegistry<T>>,
        listeners: ListenerSet,
        outcomes: Arc<Outcomes>,
    ) -> Self {
        Self {
            steps,
            table,
            registry,
            listeners,
            outcomes,
        }
    }

    fn transitions(&self) -> Transitions<'_> {
        Transitions {
            table: &self.table,
            listeners: &self.listeners,
            outcomes: &self.outcomes,
        }
    }

    fn advance(&self, slot: &ItemSlot<T>, to: StateTag, failure: Option<Arc<StepFailure>>) -> Result<()> {
        self.transitions().apply(slot, to, failure)
    }

    /// Take an item out of `Scheduled`. Returns false when there is nothing
    /// left to do for it.
    fn claim(&self, slot: &ItemSlot<T>) -> Result<bool> {
        let moved = self.transitions().apply_when(slot, |record| {
            if record.state.is_terminal() {
                return None;
            }
            let to = if slot.cancel.is_cancelled() {
                StateTag::Cancelled
            } else {
                StateTag::Running
            };
            Some((to, None))
        })?;

        match moved {
            Some(StateTag::Running) => Ok(true),
            Some(_) => {
                mark_absent_from(&self.steps, 0);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Run one item to a terminal state, then settle it in the registry
    pub async fn drive(&self, slot: Arc<ItemSlot<T>>) {
        let mut guard = PanicGuard::new(self, &slot);

        match self.claim(&slot) {
            Ok(true) => {
                let outcome = self.traverse(&slot).await;
                if let Err(e) = self.finish(&slot, outcome) {
                    error!("Item {} could not reach a terminal state: {}", slot.identity, e);
                }
            }
            Ok(false) => {}
            Err(e) => error!("Item {} could not be claimed: {}", slot.identity, e),
        }

        guard.disarm();
        self.registry.settle(&slot);
    }

    async fn traverse(&self, slot: &ItemSlot<T>) -> Outcome {
        for (position, descriptor) in self.steps.iter().enumerate() {
            if slot.cancel.is_cancelled() {
                return Outcome::Cancelled { next: position };
            }

            match &descriptor.kind {
                StepKind::Barrier(barrier) => {
                    debug!("Item {} waiting at barrier '{}'", slot.identity.short(), descriptor.name());
                    tokio::select! {
                        _ = barrier.pass() => {}
                        _ = slot.cancel.cancelled() => return Outcome::Cancelled { next: position + 1 },
                    }
                    slot.lock().completed_steps += 1;
                }
                StepKind::CountedBarrier(barrier) => {
                    debug!("Item {} arrived at barrier '{}'", slot.identity.short(), descriptor.name());
                    if barrier.pass(&slot.cancel).await == Passage::Withdrawn {
                        return Outcome::Cancelled { next: position + 1 };
                    }
                    slot.lock().completed_steps += 1;
                }
                StepKind::Transform(_) | StepKind::Aggregator(_) => {
                    if let Err(outcome) = self.run_position(slot, position, descriptor).await {
                        return outcome;
                    }
                }
            }
        }

        Outcome::Succeeded
    }

    /// Run a transform or aggregator position within its attempt budget.
    /// Every attempt starts from the value the item had on arrival.
    async fn run_position(
        &self,
        slot: &ItemSlot<T>,
        position: usize,
        descriptor: &StepDescriptor<T>,
    ) -> std::result::Result<(), Outcome> {
        let input = slot.lock().value.clone();
        let mut attempt = 1;

        loop {
            let cause = match self.attempt(slot, descriptor, input.clone()).await {
                Attempt::Done(output) => {
                    let mut record = slot.lock();
                    record.value = output;
                    record.completed_steps += 1;
                    return Ok(());
                }
                Attempt::Withdrawn => return Err(Outcome::Cancelled { next: position + 1 }),
                Attempt::Failed(cause) => cause,
            };

            let failure = Arc::new(StepFailure::new(
                descriptor.name(),
                attempt,
                descriptor.max_attempts(),
                cause,
            ));
            if attempt >= descriptor.max_attempts() {
                return Err(Outcome::Failed { failure, next: position });
            }

            warn!("Item {}: {}, retrying", slot.identity.short(), failure);
            if let Err(e) = self.advance(slot, StateTag::Retrying, Some(failure)) {
                let failure = self.internal_failure(descriptor, attempt, e);
                return Err(Outcome::Failed { failure, next: position });
            }
            if slot.cancel.is_cancelled() {
                return Err(Outcome::Cancelled { next: position });
            }
            if let Err(e) = self.advance(slot, StateTag::Running, None) {
                let failure = self.internal_failure(descriptor, attempt, e);
                return Err(Outcome::Failed { failure, next: position });
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        slot: &ItemSlot<T>,
        descriptor: &StepDescriptor<T>,
        input: T,
    ) -> Attempt<T> {
        match &descriptor.kind {
            StepKind::Transform(step) => match step.apply(input).await {
                Ok(output) => Attempt::Done(output),
                Err(cause) => Attempt::Failed(cause),
            },
            StepKind::Aggregator(aggregator) => {
                aggregator.push(slot.position, input, &slot.cancel).await
            }
            StepKind::Barrier(_) | StepKind::CountedBarrier(_) => Attempt::Done(input),
        }
    }

    fn internal_failure(
        &self,
        descriptor: &StepDescriptor<T>,
        attempt: usize,
        e: PipelineError,
    ) -> Arc<StepFailure> {
        Arc::new(StepFailure::new(
            descriptor.name(),
            attempt,
            descriptor.max_attempts(),
            anyhow::Error::new(e),
        ))
    }

    fn finish(&self, slot: &ItemSlot<T>, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Succeeded => {
                self.advance(slot, StateTag::Succeeded, None)?;
                info!("Item {} succeeded", slot.identity.short());
            }
            Outcome::Failed { failure, next } => {
                warn!("Item {} failed: {}", slot.identity.short(), failure);
                mark_absent_from(&self.steps, next);
                self.advance(slot, StateTag::Failed, Some(failure))?;
            }
            Outcome::Cancelled { next } => {
                mark_absent_from(&self.steps, next);
                self.advance(slot, StateTag::Cancelled, None)?;
                info!("Item {} cancelled", slot.identity.short());
            }
        }
        Ok(())
    }

    /// Fail an item whose worker died mid-traversal
    fn force_fail(&self, slot: &ItemSlot<T>) {
        let mut reached = 0;
        let moved = self.transitions().apply_when(slot, |record| {
            if record.state.is_terminal() {
                return None;
            }
            reached = record.completed_steps;

            let position = reached.min(self.steps.len().saturating_sub(1));
            let (name, max_attempts) = self
                .steps
                .get(position)
                .map(|d| (d.name().to_string(), d.max_attempts()))
                .unwrap_or_else(|| ("<none>".to_string(), 1));
            let failure = StepFailure::new(
                name,
                1,
                max_attempts,
                anyhow!("worker panicked while driving the item"),
            );
            Some((StateTag::Failed, Some(Arc::new(failure))))
        });

        match moved {
            Ok(Some(_)) => mark_absent_from(&self.steps, reached),
            Ok(None) => {}
            Err(e) => error!(
                "Item {} could not be failed after a worker panic: {}",
                slot.identity, e
            ),
        }
    }
}

/// Fails the item if the worker unwinds before finishing it
struct PanicGuard<'a, T: Clone + Send + Sync + 'static> {
    executor: &'a ItemExecutor<T>,
    slot: &'a ItemSlot<T>,
    armed: bool,
}

impl<'a, T: Clone + Send + Sync + 'static> PanicGuard<'a, T> {
    fn new(executor: &'a ItemExecutor<T>, slot: &'a ItemSlot<T>) -> Self {
        Self {
            executor,
            slot,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for PanicGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed && std::thread::panicking() {
            error!("Worker for item {} panicked", self.slot.identity);
            self.executor.force_fail(self.slot);
            self.executor.registry.settle(self.slot);
        }
    }
}
