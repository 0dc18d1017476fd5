//! Barriers - chain positions that hold items until lifted
//!
//! A [`ManualBarrier`] opens when the application says so. A
//! [`CountedBarrier`] opens by itself once a set number of items is
//! accounted for.

use crate::core::{PipelineError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct BarrierInner {
    lifted: watch::Sender<bool>,
    blocked: AtomicUsize,
}

/// Holds every item that reaches it until `lift` is called
///
/// Once lifted the barrier stays open; items arriving later pass straight
/// through. Clones share the same barrier.
#[derive(Clone)]
pub struct ManualBarrier {
    inner: Arc<BarrierInner>,
}

impl ManualBarrier {
    pub fn new() -> Self {
        let (lifted, _) = watch::channel(false);
        Self {
            inner: Arc::new(BarrierInner {
                lifted,
                blocked: AtomicUsize::new(0),
            }),
        }
    }

    /// Release every held item and keep the barrier open
    pub fn lift(&self) {
        self.inner.lifted.send_replace(true);
    }

    pub fn is_lifted(&self) -> bool {
        *self.inner.lifted.borrow()
    }

    /// Number of items currently held
    pub fn blocked_count(&self) -> usize {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// Wait until the barrier is lifted
    pub(crate) async fn pass(&self) {
        let mut lifted = self.inner.lifted.subscribe();
        if *lifted.borrow_and_update() {
            return;
        }

        let _held = HeldGuard::new(&self.inner.blocked);
        // The sender lives as long as `self`, so this only returns once lifted
        let _ = lifted.wait_for(|open| *open).await;
    }
}

impl Default for ManualBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualBarrier")
            .field("lifted", &self.is_lifted())
            .field("blocked", &self.blocked_count())
            .finish()
    }
}

/// Counts an item as held for as long as it is alive, including when the
/// wait is abandoned because the item was cancelled.
struct HeldGuard<'a>(&'a AtomicUsize);

impl<'a> HeldGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How an item left a counted barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Passage {
    Passed,
    /// Cancelled while held; the item now counts as absent
    Withdrawn,
}

struct Tally {
    capacity: usize,
    arrived: usize,
    absent: usize,
}

impl Tally {
    fn is_full(&self) -> bool {
        self.arrived + self.absent >= self.capacity
    }
}

struct CountedInner {
    lifted: watch::Sender<bool>,
    tally: Mutex<Tally>,
}

/// Holds items until `capacity` of them are accounted for
///
/// An item is accounted for when it arrives, or when it ends (fails or is
/// cancelled) before it could arrive. The barrier then lifts and stays open.
/// Clones share the same barrier.
#[derive(Clone)]
pub struct CountedBarrier {
    inner: Arc<CountedInner>,
}

impl CountedBarrier {
    pub fn new(capacity: usize) -> Self {
        let (lifted, _) = watch::channel(false);
        Self {
            inner: Arc::new(CountedInner {
                lifted,
                tally: Mutex::new(Tally {
                    capacity,
                    arrived: 0,
                    absent: 0,
                }),
            }),
        }
    }

    // Lifting happens under the tally lock, so the flag and the counts
    // never disagree for a reader holding it.
    fn tally(&self) -> MutexGuard<'_, Tally> {
        self.inner.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lift_if_full(&self, tally: &Tally) {
        if tally.is_full() && !*self.inner.lifted.borrow() {
            debug!(
                "Counted barrier lifted ({} arrived, {} absent)",
                tally.arrived, tally.absent
            );
            self.inner.lifted.send_replace(true);
        }
    }

    pub fn capacity(&self) -> usize {
        self.tally().capacity
    }

    /// Items that arrived before the barrier lifted
    pub fn arrivals(&self) -> usize {
        self.tally().arrived
    }

    /// Items that ended before reaching the barrier
    pub fn absentees(&self) -> usize {
        self.tally().absent
    }

    pub fn is_lifted(&self) -> bool {
        *self.inner.lifted.borrow()
    }

    /// Change how many items the barrier waits for
    ///
    /// Fails when the barrier already lifted, or when more items than
    /// `capacity` are already accounted for.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        let mut tally = self.tally();
        if *self.inner.lifted.borrow() {
            return Err(PipelineError::IllegalState(
                "Cannot change the capacity of a lifted barrier".to_string(),
            ));
        }
        if capacity == 0 || capacity < tally.arrived + tally.absent {
            return Err(PipelineError::IllegalState(format!(
                "Cannot change the capacity from {} to {}: {} items are already accounted for",
                tally.capacity,
                capacity,
                tally.arrived + tally.absent
            )));
        }
        tally.capacity = capacity;
        self.lift_if_full(&tally);
        Ok(())
    }

    /// Account for an item that will never arrive
    pub(crate) fn mark_absent(&self) {
        let mut tally = self.tally();
        if *self.inner.lifted.borrow() {
            return;
        }
        tally.absent += 1;
        self.lift_if_full(&tally);
    }

    /// Arrive and wait for the barrier to lift, or for `cancel`
    pub(crate) async fn pass(&self, cancel: &CancellationToken) -> Passage {
        let mut lifted = self.inner.lifted.subscribe();
        {
            let mut tally = self.tally();
            if *lifted.borrow_and_update() {
                return Passage::Passed;
            }
            tally.arrived += 1;
            self.lift_if_full(&tally);
        }

        tokio::select! {
            _ = lifted.wait_for(|open| *open) => Passage::Passed,
            _ = cancel.cancelled() => self.withdraw(),
        }
    }

    fn withdraw(&self) -> Passage {
        let mut tally = self.tally();
        if *self.inner.lifted.borrow() {
            return Passage::Passed;
        }
        tally.arrived -= 1;
        tally.absent += 1;
        Passage::Withdrawn
    }
}

impl fmt::Debug for CountedBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tally = self.tally();
        f.debug_struct("CountedBarrier")
            .field("capacity", &tally.capacity)
            .field("arrived", &tally.arrived)
            .field("absent", &tally.absent)
            .field("lifted", &*self.inner.lifted.borrow())
            .finish()
    }
}
