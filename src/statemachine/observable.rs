//! Listener registry
//!
//! Process-local fan-out of entity events. Registration happens at startup and
//! iteration on every persisted transition, so a plain `RwLock<Vec<_>>` is enough.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Registry of listeners of type `L` (usually a trait object)
pub struct Observable<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Observable<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn unregister(&self, listener: &Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke `f` on every registered listener, in registration order
    pub fn invoke_for_each(&self, mut f: impl FnMut(&L)) {
        // Snapshot so listeners may register others without deadlocking
        let snapshot: Vec<Arc<L>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &snapshot {
            f(listener);
        }
    }
}

impl<L: ?Sized> Default for Observable<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts transitions per `(kind, state)`; registered as a listener on both planes
#[derive(Debug, Default)]
pub struct TransitionCounter {
    counts: Mutex<HashMap<(&'static str, &'static str), u64>>,
}

impl TransitionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: &'static str, state: &'static str) {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((kind, state))
            .or_insert(0) += 1;
    }

    pub fn count(&self, kind: &str, state: &str) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((k, s), _)| *k == kind && *s == state)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Sorted `(kind, state, count)` rows
    pub fn snapshot(&self) -> Vec<(&'static str, &'static str, u64)> {
        let mut rows: Vec<_> = self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|((kind, state), count)| (*kind, *state, *count))
            .collect();
        rows.sort();
        rows
    }
}
