// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{CheckpointKey, CheckpointStore};
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_key BLOB PRIMARY KEY NOT NULL,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// SQLite-backed checkpoint store.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Wrap an existing pool, creating the schema if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(StoreError::db("create_schema"))?;
        Ok(Self { pool })
    }

    /// Open (or create) a SQLite database file.
    ///
    /// Parent directories are created if they don't exist.
    ///
    /// ```ignore
    /// let store = SqliteCheckpointStore::from_path(".data/flowstate.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                StoreError::Open(format!("failed to connect to SQLite at {:?}: {}", path, e))
            })?;

        Self::new(pool).await
    }

    /// Open a private in-memory database. Contents vanish on drop.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // A single connection, otherwise each connection gets its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Self::new(pool).await
    }

    /// Number of stored checkpoints.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::db("count"))?;
        Ok(count)
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, key: &CheckpointKey, bytes: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO checkpoints (checkpoint_key, data) VALUES (?, ?)")
            .bind(key.as_bytes().as_slice())
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(StoreError::db("put"))?;
        Ok(())
    }

    async fn remove(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM checkpoints WHERE checkpoint_key = ?")
            .bind(key.as_bytes().as_slice())
            .execute(&self.pool)
            .await
            .map_err(StoreError::db("remove"))?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let rows: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM checkpoints ORDER BY created_at, checkpoint_key")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::db("all"))?;
        Ok(rows.into_iter().map(|(data,)| data).collect())
    }

    async fn replace(
        &self,
        previous: Option<&CheckpointKey>,
        key: &CheckpointKey,
        new: &[u8],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::db("replace"))?;

        sqlx::query("INSERT OR IGNORE INTO checkpoints (checkpoint_key, data) VALUES (?, ?)")
            .bind(key.as_bytes().as_slice())
            .bind(new)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::db("replace"))?;

        if let Some(prev) = previous
            && prev != key
        {
            sqlx::query("DELETE FROM checkpoints WHERE checkpoint_key = ?")
                .bind(prev.as_bytes().as_slice())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db("replace"))?;
        }

        tx.commit().await.map_err(StoreError::db("replace"))?;
        Ok(())
    }
}
