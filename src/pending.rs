//! Concurrent in-flight markers with guaranteed release

use dashmap::DashSet;

/// Set of keys with an operation currently in flight.
///
/// Acquisition is an atomic test-and-insert, so at most one caller holds a
/// given key. The marker is released when the returned [`PendingGuard`] is
/// dropped, which covers early returns, errors, panics and cancelled futures.
#[derive(Debug, Default)]
pub struct PendingSet {
    keys: DashSet<String>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as pending, or return `None` if it already is
    pub fn try_acquire(&self, key: &str) -> Option<PendingGuard<'_>> {
        if self.keys.insert(key.to_string()) {
            Some(PendingGuard {
                set: self,
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Holds a pending marker; releases it on drop
#[derive(Debug)]
pub struct PendingGuard<'a> {
    set: &'a PendingSet,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.set.keys.remove(&self.key);
    }
}
