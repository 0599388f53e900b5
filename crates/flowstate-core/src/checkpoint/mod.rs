// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint records and the storage contract they are persisted through.
//!
//! A checkpoint is stored under the SHA-256 of its own serialized bytes, so
//! the store is a plain key/value map of opaque blobs. The manager never
//! inspects keys beyond using them as handles.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryCheckpointStore;
pub use self::postgres::PostgresCheckpointStore;
pub use self::sqlite::SqliteCheckpointStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FlowError, StoreError};
use crate::manager::FlowRunId;

/// Content hash of a serialized checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey([u8; 32]);

impl CheckpointKey {
    /// Hash the given checkpoint bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rebuild a key from stored digest bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A suspended flow: its state plus where and what it is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run id of the suspended flow.
    pub run_id: FlowRunId,
    /// Registered name of the flow type, used to rebuild it on restore.
    pub flow_name: String,
    /// Name the flow logs under.
    pub logger_name: String,
    /// Full topic (`topic.session`) the flow is waiting on.
    pub awaiting_topic: String,
    /// Payload type tag the flow expects.
    pub awaiting_type: String,
    /// Serialized flow state.
    pub flow_state: serde_json::Value,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Serialize to the bytes that get stored and hashed.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FlowError> {
        serde_json::to_vec(self).map_err(|e| FlowError::Serialization {
            context: format!("checkpoint for flow '{}'", self.logger_name),
            details: e.to_string(),
        })
    }

    /// Parse stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Durable key/value storage for checkpoint blobs.
///
/// Implementations must be safe to call from multiple tasks concurrently.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store `bytes` under `key`. Writing an existing key is a no-op.
    async fn put(&self, key: &CheckpointKey, bytes: &[u8]) -> Result<(), StoreError>;

    /// Remove the blob stored under `key`, if any.
    async fn remove(&self, key: &CheckpointKey) -> Result<(), StoreError>;

    /// Every stored blob. Only used at startup.
    async fn all(&self) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Write `new` and remove `previous` in one step.
    ///
    /// The default runs the two operations back to back; database adapters
    /// override it with a transaction.
    async fn replace(
        &self,
        previous: Option<&CheckpointKey>,
        key: &CheckpointKey,
        new: &[u8],
    ) -> Result<(), StoreError> {
        self.put(key, new).await?;
        if let Some(prev) = previous {
            if prev != key {
                self.remove(prev).await?;
            }
        }
        Ok(())
    }
}

/// Persist a new checkpoint, replacing the previous one for the same flow.
///
/// Returns the key of the new checkpoint.
pub async fn persist(
    store: &dyn CheckpointStore,
    previous: Option<&CheckpointKey>,
    new: &[u8],
) -> Result<CheckpointKey, StoreError> {
    let key = CheckpointKey::of(new);
    store.replace(previous, &key, new).await?;
    Ok(key)
}
