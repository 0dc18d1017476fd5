//! Sharded registry of admitted items

use crate::core::{Identity, State};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Mutable part of an in-flight item; only touched under the record lock
pub(crate) struct ItemRecord<T> {
    pub state: State,
    pub value: T,
    pub completed_steps: usize,
}

/// An in-flight item
///
/// Two locks guard it. The record lock is only held for short reads and
/// writes and never across a listener call. The delivery lock is held from
/// the moment a transition is decided until every listener has seen it, so
/// one item's transitions reach listeners one at a time and in order.
pub(crate) struct ItemSlot<T> {
    pub identity: Identity,
    pub label: Option<String>,
    /// Admission order, used to order aggregated batches
    pub position: u64,
    pub cancel: CancellationToken,
    record: Mutex<ItemRecord<T>>,
    delivery: Mutex<()>,
}

impl<T> ItemSlot<T> {
    fn new(identity: Identity, label: Option<String>, position: u64, value: T) -> Self {
        Self {
            identity,
            label,
            position,
            cancel: CancellationToken::new(),
            record: Mutex::new(ItemRecord {
                state: State::initial(),
                value,
                completed_steps: 0,
            }),
            delivery: Mutex::new(()),
        }
    }

    /// Lock the record. Nothing runs user code while holding it, so a
    /// poisoned lock still guards a whole record.
    pub fn lock(&self) -> MutexGuard<'_, ItemRecord<T>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize delivery of this item's transitions
    pub fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What remains of an item once it reached a terminal state
pub(crate) struct SettledItem<T> {
    pub label: Option<String>,
    pub state: State,
    pub value: T,
    pub completed_steps: usize,
}

pub(crate) enum ItemEntry<T> {
    Active(Arc<ItemSlot<T>>),
    Settled(Arc<SettledItem<T>>),
}

impl<T> Clone for ItemEntry<T> {
    fn clone(&self) -> Self {
        match self {
            ItemEntry::Active(slot) => ItemEntry::Active(Arc::clone(slot)),
            ItemEntry::Settled(item) => ItemEntry::Settled(Arc::clone(item)),
        }
    }
}

type Shard<T> = RwLock<HashMap<Identity, ItemEntry<T>>>;

/// Identity-keyed arena of items, split into shards so that admissions and
/// lookups for different items rarely contend
pub(crate) struct ItemRegistry<T> {
    shards: Box<[Shard<T>]>,
    admitted: AtomicU64,
}

impl<T: Clone> ItemRegistry<T> {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            admitted: AtomicU64::new(0),
        }
    }

    fn shard(&self, identity: &Identity) -> &Shard<T> {
        &self.shards[identity.bucket(self.shards.len())]
    }

    /// Admit a value under a fresh identity in the initial state
    pub fn admit(&self, value: T, label: Option<String>) -> Arc<ItemSlot<T>> {
        let position = self.admitted.fetch_add(1, Ordering::SeqCst);
        loop {
            let identity = Identity::new();
            let mut shard = self.shard(&identity).write().unwrap_or_else(PoisonError::into_inner);
            if shard.contains_key(&identity) {
                continue;
            }

            let slot = Arc::new(ItemSlot::new(identity, label, position, value));
            shard.insert(identity, ItemEntry::Active(Arc::clone(&slot)));
            return slot;
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<ItemEntry<T>> {
        self.shard(identity)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// The slot of an item that has not settled yet
    pub fn active(&self, identity: &Identity) -> Option<Arc<ItemSlot<T>>> {
        match self.get(identity)? {
            ItemEntry::Active(slot) => Some(slot),
            ItemEntry::Settled(_) => None,
        }
    }

    /// Replace a terminal item's slot with its settled record. Calling it
    /// again, or for a non-terminal item, does nothing.
    pub fn settle(&self, slot: &ItemSlot<T>) {
        let settled = {
            let record = slot.lock();
            if !record.state.is_terminal() {
                return;
            }
            SettledItem {
                label: slot.label.clone(),
                state: record.state.clone(),
                value: record.value.clone(),
                completed_steps: record.completed_steps,
            }
        };

        let mut shard = self.shard(&slot.identity).write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = shard.get_mut(&slot.identity) {
            if matches!(entry, ItemEntry::Active(_)) {
                *entry = ItemEntry::Settled(Arc::new(settled));
            }
        }
    }

    /// Identities admitted with `label`
    pub fn labeled(&self, label: &str) -> Vec<Identity> {
        let mut found = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            found.extend(shard.iter().filter_map(|(identity, entry)| {
                let item_label = match entry {
                    ItemEntry::Active(slot) => slot.label.as_deref(),
                    ItemEntry::Settled(item) => item.label.as_deref(),
                };
                (item_label == Some(label)).then_some(*identity)
            }));
        }
        found
    }

    /// Number of admitted items, settled or not
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Number of items that have not settled
    pub fn in_flight(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|entry| matches!(entry, ItemEntry::Active(_)))
                    .count()
            })
            .sum()
    }
}
