//! Identity map.

use crate::types::{IdentityKey, InstanceId};
use std::collections::HashMap;

/// Maps each persistent identity to the single live record for it.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, InstanceId>,
}

impl IdentityMap {
    /// Creates an empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the instance stored under `key`.
    #[must_use]
    pub fn get(&self, key: &IdentityKey) -> Option<InstanceId> {
        self.entries.get(key).copied()
    }

    /// Returns true if `key` is mapped.
    #[must_use]
    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns true if `id` is mapped under any key.
    #[must_use]
    pub fn contains_instance(&self, id: InstanceId) -> bool {
        self.entries.values().any(|v| *v == id)
    }

    /// Number of mapped identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over mapped instances, in no particular order.
    pub fn instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.entries.values().copied()
    }

    /// Iterates over `(key, instance)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, InstanceId)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    pub(crate) fn insert(&mut self, key: IdentityKey, id: InstanceId) -> Option<InstanceId> {
        self.entries.insert(key, id)
    }

    /// Removes `key` only if it still maps to `id`.
    pub(crate) fn remove(&mut self, key: &IdentityKey, id: InstanceId) -> bool {
        if self.entries.get(key) == Some(&id) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
