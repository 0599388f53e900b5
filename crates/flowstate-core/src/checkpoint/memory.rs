// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory checkpoint store.
//!
//! Not durable. Used by tests and by nodes that run with checkpointing off.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CheckpointKey, CheckpointStore};
use crate::error::StoreError;

/// Mutex-guarded map of checkpoint blobs.
///
/// Clones share the same map, so a test can keep a handle across a simulated
/// restart of the manager.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    entries: Arc<Mutex<BTreeMap<CheckpointKey, Vec<u8>>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a blob is stored under `key`.
    pub fn contains(&self, key: &CheckpointKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stored keys, in key order.
    pub fn keys(&self) -> Vec<CheckpointKey> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<CheckpointKey, Vec<u8>>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, key: &CheckpointKey, bytes: &[u8]) -> Result<(), StoreError> {
        self.lock().entry(*key).or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn replace(
        &self,
        previous: Option<&CheckpointKey>,
        key: &CheckpointKey,
        new: &[u8],
    ) -> Result<(), StoreError> {
        let mut entries = self.lock();
        if let Some(prev) = previous {
            entries.remove(prev);
        }
        entries.insert(*key, new.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_remove_all() {
        let store = MemoryCheckpointStore::new();
        let key = CheckpointKey::of(b"state");

        store.put(&key, b"state").await.unwrap();
        assert!(store.contains(&key));
        assert_eq!(store.len(), 1);

        store.remove(&key).await.unwrap();
        assert!(store.is_empty());
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryCheckpointStore::new();
        let other = store.clone();
        let key = CheckpointKey::of(b"shared");

        store.put(&key, b"shared").await.unwrap();
        assert_eq!(other.keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_remove_missing_key_is_noop() {
        let store = MemoryCheckpointStore::new();
        store.remove(&CheckpointKey::of(b"nope")).await.unwrap();
        assert!(store.is_empty());
    }
}
