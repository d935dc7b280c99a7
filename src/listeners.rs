//! Handle-based listener registry.
//!
//! Subscribers register a callback and receive a [`ListenerId`]; removal is
//! by id, never by comparing closures.
//!
//! # Dispatch
//!
//! [`ListenerSet::emit`] copies the listener list under the lock, releases
//! the lock, then invokes each callback. A callback may therefore subscribe,
//! unsubscribe (itself included) or trigger another emit without
//! deadlocking or invalidating the iteration. A panicking callback is caught
//! and logged; the remaining callbacks still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque handle returned by [`ListenerSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener_{}", self.0)
    }
}

/// Shared callback type.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of callbacks for events of type `T`.
pub struct ListenerSet<T> {
    /// Component tag used in log lines.
    name: &'static str,
    entries: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("name", &self.name)
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> ListenerSet<T> {
    /// Create an empty set. `name` tags panic reports in the log.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<T>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener`; it runs after every listener added before it.
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove the listener registered under `id`.
    ///
    /// Returns `false` if it was already removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Invoke every listener registered at the time of the call with `value`.
    ///
    /// Returns the number of listeners that panicked.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<(ListenerId, Listener<T>)> = self.lock().clone();

        let mut failures = 0;
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                failures += 1;
                log::error!("[{}] {} panicked during dispatch", self.name, id);
            }
        }
        failures
    }
}
