//! Thread-safe method set used to find per-method policies removed between
//! two config snapshots

use std::collections::HashSet;

use parking_lot::Mutex;

/// Set of method names configured by the most recent payload.
#[derive(Debug, Default)]
pub struct ThreadSafeSet {
    inner: Mutex<HashSet<String>>,
}

impl ThreadSafeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored set with `next` and return the members that were
    /// present before but are absent from `next`, sorted.
    ///
    /// The diff and the replacement happen under one lock.
    pub fn diff_and_emplace(&self, next: HashSet<String>) -> Vec<String> {
        let mut current = self.inner.lock();
        let mut removed: Vec<String> = current.difference(&next).cloned().collect();
        removed.sort();
        *current = next;
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
