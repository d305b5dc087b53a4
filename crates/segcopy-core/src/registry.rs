//! Per-service shard state registry

use crate::shard::ShardId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Concurrent map from shard ID to shared per-shard state
pub struct ShardRegistry<T> {
    entries: DashMap<ShardId, Arc<T>>,
}

impl<T> Default for ShardRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> ShardRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the state of a shard
    pub fn get(&self, shard_id: &ShardId) -> Option<Arc<T>> {
        self.entries.get(shard_id).map(|e| e.value().clone())
    }

    /// Return the existing state or insert the one built by `create`
    ///
    /// `create` runs at most once and only while the slot is vacant; if it
    /// fails nothing is inserted.
    pub fn get_or_try_insert<E>(
        &self,
        shard_id: &ShardId,
        create: impl FnOnce() -> std::result::Result<Arc<T>, E>,
    ) -> std::result::Result<Arc<T>, E> {
        match self.entries.entry(shard_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let value = create()?;
                entry.insert(value.clone());
                Ok(value)
            }
        }
    }

    /// Remove the state of a shard
    pub fn remove(&self, shard_id: &ShardId) -> Option<Arc<T>> {
        self.entries.remove(shard_id).map(|(_, v)| v)
    }

    /// Snapshot of all registered states
    pub fn values(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Whether a shard is registered
    pub fn contains(&self, shard_id: &ShardId) -> bool {
        self.entries.contains_key(shard_id)
    }

    /// Number of registered shards
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
