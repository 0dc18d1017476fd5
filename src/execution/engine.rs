//! Main execution engine - the pipeline orchestrator
//!
//! A [`Pipeline`] owns the step chain, the registry of admitted items and
//! the listeners. Items are admitted with [`Pipeline::submit`] and driven
//! to a terminal state by [`Pipeline::run`], one tokio task per item.

use crate::core::step::StepKind;
use crate::core::{
    Aggregate, EngineConfig, Identity, PipelineError, Result, State, StateChangeListener, StateTag,
    Step, StepDescriptor, TransitionTable,
};
use crate::execution::aggregator::Aggregator;
use crate::execution::barrier::{CountedBarrier, ManualBarrier};
use crate::execution::dispatch::ListenerRegistry;
use crate::execution::executor::{mark_absent_from, ItemExecutor, Outcomes, Transitions};
use crate::execution::registry::{ItemEntry, ItemRegistry};
use crate::execution::{ExecutionScheduler, SchedulingStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// Summary of one call to [`Pipeline::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Items handed to a worker during this run
    pub driven: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Point-in-time counters for a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub submitted: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub listener_failures: usize,
}

impl PipelineStats {
    /// Fraction of submitted items that reached a terminal state
    pub fn progress(&self) -> f64 {
        if self.submitted == 0 {
            return 1.0;
        }
        (self.succeeded + self.failed + self.cancelled) as f64 / self.submitted as f64
    }
}

/// What is known about one item right now
#[derive(Debug, Clone)]
pub struct ItemSnapshot {
    pub identity: Identity,
    pub label: Option<String>,
    pub state: State,
    pub completed_steps: usize,
    pub total_steps: usize,
}

impl ItemSnapshot {
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 1.0;
        }
        self.completed_steps as f64 / self.total_steps as f64
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder<T> {
    name: String,
    steps: Vec<StepDescriptor<T>>,
    strategy: SchedulingStrategy,
    table: Option<TransitionTable>,
    registry_shards: usize,
    default_max_attempts: usize,
}

impl<T: Clone + Send + Sync + 'static> PipelineBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &EngineConfig::default())
    }

    /// Start from engine settings loaded from configuration
    pub fn from_config(name: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            strategy: config.scheduling_strategy(),
            table: config.retries.then(TransitionTable::with_retries),
            registry_shards: config.registry_shards,
            default_max_attempts: config.default_max_attempts,
        }
    }

    /// Append a step using the default number of attempts
    pub fn step<S>(self, name: impl Into<String>, step: S) -> Self
    where
        S: Step<T> + 'static,
    {
        let attempts = self.default_max_attempts;
        self.step_with_attempts(name, attempts, step)
    }

    /// Append a step that may be invoked up to `max_attempts` times per item
    pub fn step_with_attempts<S>(mut self, name: impl Into<String>, max_attempts: usize, step: S) -> Self
    where
        S: Step<T> + 'static,
    {
        self.steps
            .push(StepDescriptor::transform(name.into(), max_attempts, Arc::new(step)));
        self
    }

    /// Append a barrier that holds items until lifted through
    /// [`Pipeline::manual_barrier`]
    pub fn manual_barrier(mut self, name: impl Into<String>) -> Self {
        self.steps
            .push(StepDescriptor::barrier(name.into(), ManualBarrier::new()));
        self
    }

    /// Append a barrier that lifts once `capacity` items arrived or ended
    /// before reaching it, see [`Pipeline::counted_barrier`]
    pub fn counted_barrier(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.steps.push(StepDescriptor::counted_barrier(
            name.into(),
            CountedBarrier::new(capacity),
        ));
        self
    }

    /// Append an aggregator that processes `capacity` items as one batch,
    /// using the default number of attempts
    pub fn aggregator<A>(self, name: impl Into<String>, capacity: usize, action: A) -> Self
    where
        A: Aggregate<T> + 'static,
    {
        let attempts = self.default_max_attempts;
        self.aggregator_with_attempts(name, capacity, attempts, action)
    }

    /// Append an aggregator whose batch may be tried up to `max_attempts`
    /// times
    pub fn aggregator_with_attempts<A>(
        mut self,
        name: impl Into<String>,
        capacity: usize,
        max_attempts: usize,
        action: A,
    ) -> Self
    where
        A: Aggregate<T> + 'static,
    {
        let aggregator = Aggregator::new(capacity, Arc::new(action));
        self.steps
            .push(StepDescriptor::aggregator(name.into(), max_attempts, aggregator));
        self
    }

    pub fn strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn transition_table(mut self, table: TransitionTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn registry_shards(mut self, shards: usize) -> Self {
        self.registry_shards = shards;
        self
    }

    pub fn build(self) -> Result<Pipeline<T>> {
        if self.registry_shards == 0 {
            return Err(PipelineError::InvalidDefinition(
                "registry_shards must be at least 1".to_string(),
            ));
        }

        let mut gate_names = HashSet::new();
        let mut gates = Gates::default();
        for descriptor in &self.steps {
            let name = descriptor.name();
            if descriptor.max_attempts() == 0 {
                return Err(PipelineError::InvalidDefinition(format!(
                    "Step '{}' must allow at least one attempt",
                    name
                )));
            }

            let capacity = match &descriptor.kind {
                StepKind::Transform(_) => continue,
                StepKind::Barrier(barrier) => {
                    gates.manual.insert(name.to_string(), barrier.clone());
                    None
                }
                StepKind::CountedBarrier(barrier) => {
                    gates.counted.insert(name.to_string(), barrier.clone());
                    Some(barrier.capacity())
                }
                StepKind::Aggregator(aggregator) => {
                    gates.aggregators.insert(name.to_string(), aggregator.clone());
                    Some(aggregator.capacity())
                }
            };
            if capacity == Some(0) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "'{}' must wait for at least one item",
                    name
                )));
            }
            if !gate_names.insert(name.to_string()) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "Duplicate barrier or aggregator name: {}",
                    name
                )));
            }
        }

        let retries = self.steps.iter().any(|d| d.max_attempts() > 1);
        let table = self.table.unwrap_or_else(|| {
            if retries {
                TransitionTable::with_retries()
            } else {
                TransitionTable::standard()
            }
        });
        // An item cancelled between attempts leaves from Retrying
        let retry_edges = [
            (StateTag::Running, StateTag::Retrying),
            (StateTag::Retrying, StateTag::Running),
            (StateTag::Retrying, StateTag::Cancelled),
        ];
        if let Some((from, to)) = retries
            .then(|| retry_edges.into_iter().find(|&(from, to)| !table.is_legal(from, to)))
            .flatten()
        {
            return Err(PipelineError::InvalidDefinition(format!(
                "Steps with more than one attempt need the {} -> {} transition",
                from, to
            )));
        }

        let scheduler = ExecutionScheduler::new(self.strategy)?;
        info!(
            "Built pipeline '{}' with {} steps ({:?})",
            self.name,
            self.steps.len(),
            self.strategy
        );

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                name: self.name,
                steps: self.steps.into(),
                gates,
                table,
                registry: Arc::new(ItemRegistry::new(self.registry_shards)),
                scheduler,
                listeners: ListenerRegistry::default(),
                outcomes: Arc::new(Outcomes::default()),
                running: Arc::new(AtomicBool::new(false)),
            }),
        })
    }
}

/// Named chain positions an application can reach into
struct Gates<T> {
    manual: HashMap<String, ManualBarrier>,
    counted: HashMap<String, CountedBarrier>,
    aggregators: HashMap<String, Aggregator<T>>,
}

impl<T> Default for Gates<T> {
    fn default() -> Self {
        Self {
            manual: HashMap::new(),
            counted: HashMap::new(),
            aggregators: HashMap::new(),
        }
    }
}

struct PipelineInner<T> {
    name: String,
    steps: Arc<[StepDescriptor<T>]>,
    gates: Gates<T>,
    table: TransitionTable,
    registry: Arc<ItemRegistry<T>>,
    scheduler: ExecutionScheduler,
    listeners: ListenerRegistry,
    outcomes: Arc<Outcomes>,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// An ordered chain of steps applied to every submitted item
///
/// Clones share the same items, listeners and barriers.
pub struct Pipeline<T> {
    inner: Arc<PipelineInner<T>>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Pipeline<T> {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<T> {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn steps(&self) -> &[StepDescriptor<T>] {
        &self.inner.steps
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.inner.scheduler.strategy()
    }

    pub fn transition_table(&self) -> &TransitionTable {
        &self.inner.table
    }

    /// Add a listener. Only allowed before the first run starts.
    pub fn register<L>(&self, listener: L) -> Result<()>
    where
        L: StateChangeListener + 'static,
    {
        self.inner.listeners.register(Arc::new(listener))
    }

    /// Admit a value; it starts in `Scheduled`
    pub fn submit(&self, value: T) -> Identity {
        self.admit(value, None)
    }

    /// Admit a value under a label, see [`Pipeline::identities_labeled`]
    pub fn submit_labeled(&self, value: T, label: impl Into<String>) -> Identity {
        self.admit(value, Some(label.into()))
    }

    fn admit(&self, value: T, label: Option<String>) -> Identity {
        let slot = self.inner.registry.admit(value, label);
        let identity = slot.identity;
        self.inner.scheduler.enqueue(identity);
        debug!("Submitted item {} to '{}'", identity, self.inner.name);
        identity
    }

    pub fn identities_labeled(&self, label: &str) -> Vec<Identity> {
        self.inner.registry.labeled(label)
    }

    fn claim_run(&self) -> Result<RunGuard> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::IllegalState(format!(
                "Pipeline '{}' is already running",
                self.inner.name
            )));
        }
        Ok(RunGuard(Arc::clone(&self.inner.running)))
    }

    /// Drive every admitted item to a terminal state
    ///
    /// Items submitted while the run is active are picked up too. Returns
    /// once no admitted item is waiting or being driven.
    pub async fn run(&self) -> Result<RunSummary> {
        let guard = self.claim_run()?;
        self.drive_all(guard).await
    }

    /// Spawn [`Pipeline::run`] on the current tokio runtime
    pub fn start(&self) -> Result<JoinHandle<Result<RunSummary>>> {
        let guard = self.claim_run()?;
        // Freeze now so that registering after `start` fails deterministically
        self.inner.listeners.freeze();

        let pipeline = self.clone();
        Ok(tokio::spawn(async move { pipeline.drive_all(guard).await }))
    }

    async fn drive_all(&self, _guard: RunGuard) -> Result<RunSummary> {
        let inner = &self.inner;
        let listeners = inner.listeners.freeze();
        let executor = Arc::new(ItemExecutor::new(
            Arc::clone(&inner.steps),
            inner.table.clone(),
            Arc::clone(&inner.registry),
            listeners,
            Arc::clone(&inner.outcomes),
        ));

        let before = self.stats();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("Starting pipeline run: {}", inner.name);

        let mut workers = JoinSet::new();
        let mut driven = 0;

        loop {
            for identity in inner.scheduler.next_batch() {
                // Items cancelled while queued are already settled
                let Some(slot) = inner.registry.active(&identity) else {
                    continue;
                };

                let permit = inner.scheduler.acquire_worker().await?;
                let executor = Arc::clone(&executor);
                workers.spawn(async move {
                    executor.drive(slot).await;
                    drop(permit);
                });
                driven += 1;
            }

            if workers.is_empty() {
                if inner.scheduler.has_pending() {
                    continue;
                }
                break;
            }

            tokio::select! {
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        error!("Worker task ended abnormally: {}", e);
                    }
                }
                _ = inner.scheduler.wait_for_work() => {}
            }
        }

        let after = self.stats();
        let summary = RunSummary {
            pipeline: inner.name.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
            driven,
            succeeded: after.succeeded - before.succeeded,
            failed: after.failed - before.failed,
            cancelled: after.cancelled - before.cancelled,
        };
        info!(
            "Pipeline run finished: {} ({} succeeded, {} failed, {} cancelled)",
            inner.name, summary.succeeded, summary.failed, summary.cancelled
        );
        Ok(summary)
    }

    /// Request cancellation of an item
    ///
    /// An item still waiting for a worker is cancelled at once. A running
    /// item stops at its next checkpoint: before a step, between attempts,
    /// or while held at a barrier or aggregator. The step in progress is
    /// never interrupted. Safe to call from a listener.
    pub fn cancel(&self, identity: Identity) -> Result<()> {
        let slot = match self.inner.registry.get(&identity) {
            None => return Err(PipelineError::UnknownIdentity(identity)),
            Some(ItemEntry::Settled(_)) => return Ok(()),
            Some(ItemEntry::Active(slot)) => slot,
        };

        slot.cancel.cancel();
        // Only a Scheduled item is moved here. Nothing moves an item back to
        // Scheduled, so a listener being told about this item never sees it
        // there and never waits on its own delivery.
        if slot.lock().state.tag() != StateTag::Scheduled {
            debug!("Cancellation requested for item {}", identity.short());
            return Ok(());
        }

        let listeners = self.inner.listeners.current();
        let transitions = Transitions {
            table: &self.inner.table,
            listeners: &listeners,
            outcomes: &self.inner.outcomes,
        };
        let moved = transitions.apply_when(&slot, |record| {
            (record.state.tag() == StateTag::Scheduled).then_some((StateTag::Cancelled, None))
        })?;

        if moved.is_some() {
            mark_absent_from(&self.inner.steps, 0);
            self.inner.registry.settle(&slot);
            info!("Item {} cancelled before it started", identity.short());
        }
        Ok(())
    }

    /// Current state of an item. Safe to call from a listener.
    pub fn status_of(&self, identity: Identity) -> Result<State> {
        match self.inner.registry.get(&identity) {
            Some(ItemEntry::Active(slot)) => Ok(slot.lock().state.clone()),
            Some(ItemEntry::Settled(item)) => Ok(item.state.clone()),
            None => Err(PipelineError::UnknownIdentity(identity)),
        }
    }

    /// Final value of a succeeded item
    pub fn result(&self, identity: Identity) -> Result<T> {
        let (state, value) = match self.inner.registry.get(&identity) {
            Some(ItemEntry::Active(slot)) => {
                let record = slot.lock();
                let value = (record.state.tag() == StateTag::Succeeded).then(|| record.value.clone());
                (record.state.clone(), value)
            }
            Some(ItemEntry::Settled(item)) => {
                let value = (item.state.tag() == StateTag::Succeeded).then(|| item.value.clone());
                (item.state.clone(), value)
            }
            None => return Err(PipelineError::UnknownIdentity(identity)),
        };
        value.ok_or(PipelineError::NotSucceeded(state))
    }

    pub fn snapshot(&self, identity: Identity) -> Result<ItemSnapshot> {
        let (label, state, completed_steps) = match self.inner.registry.get(&identity) {
            Some(ItemEntry::Active(slot)) => {
                let record = slot.lock();
                (slot.label.clone(), record.state.clone(), record.completed_steps)
            }
            Some(ItemEntry::Settled(item)) => {
                (item.label.clone(), item.state.clone(), item.completed_steps)
            }
            None => return Err(PipelineError::UnknownIdentity(identity)),
        };
        Ok(ItemSnapshot {
            identity,
            label,
            state,
            completed_steps,
            total_steps: self.inner.steps.len(),
        })
    }

    pub fn stats(&self) -> PipelineStats {
        let outcomes = &self.inner.outcomes;
        PipelineStats {
            submitted: self.inner.registry.len(),
            in_flight: self.inner.registry.in_flight(),
            succeeded: outcomes.succeeded.load(Ordering::SeqCst),
            failed: outcomes.failed.load(Ordering::SeqCst),
            cancelled: outcomes.cancelled.load(Ordering::SeqCst),
            listener_failures: outcomes.listener_failures.load(Ordering::SeqCst),
        }
    }

    /// Handle to the barrier declared under `name`
    pub fn manual_barrier(&self, name: &str) -> Option<ManualBarrier> {
        self.inner.gates.manual.get(name).cloned()
    }

    pub fn counted_barrier(&self, name: &str) -> Option<CountedBarrier> {
        self.inner.gates.counted.get(name).cloned()
    }

    pub fn aggregator(&self, name: &str) -> Option<Aggregator<T>> {
        self.inner.gates.aggregators.get(name).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of items ever submitted
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
