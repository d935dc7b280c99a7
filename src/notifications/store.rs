//! Bounded, age-limited notification store.
//!
//! Newest-first list of received notifications with per-entry read state.
//! Two eviction rules apply, both on every insert and on the periodic
//! sweep:
//!
//! - Count: at most [`StoreLimits::capacity`] entries; the oldest are dropped.
//! - Age: entries whose `occurred_at` is older than
//!   [`StoreLimits::retention`] (measured with the injected [`Clock`]) are
//!   dropped.
//!
//! All mutation happens under one lock. Change listeners are invoked after
//! the lock is released, so a listener may read or mutate the store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::NotificationEvent;
use crate::clock::{elapsed_since, Clock};
use crate::config::StoreConfig;
use crate::constants::MIN_TIMER_INTERVAL;
use crate::listeners::{ListenerId, ListenerSet};

/// Count and age bounds of a [`NotificationStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Maximum entry age.
    pub retention: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for StoreLimits {
    fn from(config: &StoreConfig) -> Self {
        Self {
            capacity: config.max_notifications,
            retention: config.retention(),
        }
    }
}

/// A notification held by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredNotification {
    /// Locally generated UUID v4.
    pub id: String,
    /// The notification as received.
    #[serde(flatten)]
    pub event: NotificationEvent,
    /// Whether the user has read it.
    pub is_read: bool,
}

/// Change emitted to store subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// A notification was inserted at the front.
    Added(StoredNotification),
    /// Entries were dropped by the count or age bound.
    Evicted(Vec<String>),
    /// A notification was removed by id.
    Removed(String),
    /// A notification was marked read.
    Read(String),
    /// Every unread notification was marked read.
    AllRead,
    /// The store was emptied.
    Cleared,
}

/// In-memory notification store.
#[derive(Debug)]
pub struct NotificationStore {
    limits: StoreLimits,
    clock: Arc<dyn Clock>,
    /// Front is newest.
    entries: Mutex<VecDeque<StoredNotification>>,
    listeners: ListenerSet<StoreChange>,
}

impl NotificationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(limits: StoreLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            entries: Mutex::new(VecDeque::new()),
            listeners: ListenerSet::new("Store"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StoredNotification>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bounds this store enforces.
    #[must_use]
    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Insert `event` at the front, unread, and enforce both bounds.
    ///
    /// Returns the generated id. An event already older than the retention
    /// window is evicted by the same call and never reported as added.
    pub fn add(&self, event: NotificationEvent) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let stored = StoredNotification {
            id: id.clone(),
            event,
            is_read: false,
        };

        let (added, evicted) = {
            let mut entries = self.lock();
            entries.push_front(stored.clone());
            let evicted = self.evict(&mut entries);
            let kept = !evicted.contains(&id);
            (kept.then_some(stored), evicted)
        };

        if let Some(added) = added {
            log::debug!("[Store] Added {} ({})", added.id, added.event.kind);
            self.listeners.emit(&StoreChange::Added(added));
        }
        self.report_evicted(evicted);
        id
    }

    /// Apply the age bound now. Returns how many entries were dropped.
    pub fn sweep(&self) -> usize {
        let evicted = {
            let mut entries = self.lock();
            self.evict(&mut entries)
        };
        let count = evicted.len();
        self.report_evicted(evicted);
        count
    }

    /// Remove the entry with `id`. Unknown ids are a no-op.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|n| n.id != id);
            entries.len() != before
        };
        if removed {
            self.listeners.emit(&StoreChange::Removed(id.to_string()));
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let had_entries = {
            let mut entries = self.lock();
            let had = !entries.is_empty();
            entries.clear();
            had
        };
        if had_entries {
            self.listeners.emit(&StoreChange::Cleared);
        }
    }

    /// Mark the entry with `id` as read. Unknown or already-read ids are a
    /// no-op.
    pub fn mark_read(&self, id: &str) -> bool {
        let changed = {
            let mut entries = self.lock();
            match entries.iter_mut().find(|n| n.id == id) {
                Some(entry) if !entry.is_read => {
                    entry.is_read = true;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.listeners.emit(&StoreChange::Read(id.to_string()));
        }
        changed
    }

    /// Mark every entry as read. Returns how many changed.
    pub fn mark_all_read(&self) -> usize {
        let changed = {
            let mut entries = self.lock();
            let mut changed = 0;
            for entry in entries.iter_mut().filter(|n| !n.is_read) {
                entry.is_read = true;
                changed += 1;
            }
            changed
        };
        if changed > 0 {
            self.listeners.emit(&StoreChange::AllRead);
        }
        changed
    }

    /// Snapshot of all entries, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<StoredNotification> {
        self.lock().iter().cloned().collect()
    }

    /// Entry with `id`, if present.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<StoredNotification> {
        self.lock().iter().find(|n| n.id == id).cloned()
    }

    /// Number of unread entries.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.lock().iter().filter(|n| !n.is_read).count()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Subscribe to store changes.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Spawn the periodic age sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped. The first sweep runs one `interval` after spawning.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(sweep_loop(store, interval))
    }

    /// Drop entries beyond capacity, then entries past retention.
    fn evict(&self, entries: &mut VecDeque<StoredNotification>) -> Vec<String> {
        let mut evicted: Vec<String> = Vec::new();

        if entries.len() > self.limits.capacity {
            evicted.extend(entries.drain(self.limits.capacity..).map(|n| n.id));
        }

        let now = self.clock.now();
        let retention = self.limits.retention;
        entries.retain(|n| {
            let keep = elapsed_since(now, n.event.occurred_at) <= retention;
            if !keep {
                evicted.push(n.id.clone());
            }
            keep
        });

        evicted
    }

    fn report_evicted(&self, evicted: Vec<String>) {
        if evicted.is_empty() {
            return;
        }
        log::debug!("[Store] Evicted {} notification(s)", evicted.len());
        self.listeners.emit(&StoreChange::Evicted(evicted));
    }
}

async fn sweep_loop(store: Weak<NotificationStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(MIN_TIMER_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; the insert path already applied
    // the bounds.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            log::debug!("[Store] Sweeper stopping, store dropped");
            break;
        };
        let dropped = store.sweep();
        if dropped > 0 {
            log::info!("[Store] Sweep dropped {} expired notification(s)", dropped);
        }
    }
}
