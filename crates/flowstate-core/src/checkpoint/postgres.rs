// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed checkpoint store.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{CheckpointKey, CheckpointStore};
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flow_checkpoints (
    checkpoint_key BYTEA PRIMARY KEY,
    data BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// PostgreSQL-backed checkpoint store.
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Wrap an existing pool, creating the schema if needed.
    pub async fn new(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(StoreError::db("create_schema"))?;
        Ok(Self { pool })
    }

    /// Connect to `database_url` and create the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Open(format!("failed to connect to PostgreSQL: {}", e)))?;
        Self::new(pool).await
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn put(&self, key: &CheckpointKey, bytes: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flow_checkpoints (checkpoint_key, data)
            VALUES ($1, $2)
            ON CONFLICT (checkpoint_key) DO NOTHING
            "#,
        )
        .bind(key.as_bytes().as_slice())
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(StoreError::db("put"))?;
        Ok(())
    }

    async fn remove(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flow_checkpoints WHERE checkpoint_key = $1")
            .bind(key.as_bytes().as_slice())
            .execute(&self.pool)
            .await
            .map_err(StoreError::db("remove"))?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT data FROM flow_checkpoints ORDER BY created_at, checkpoint_key",
        )
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

        sqlx::query(
            r#"
            INSERT INTO flow_checkpoints (checkpoint_key, data)
            VALUES ($1, $2)
            ON CONFLICT (checkpoint_key) DO NOTHING
            "#,
        )
        .bind(key.as_bytes().as_slice())
        .bind(new)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::db("replace"))?;

        if let Some(prev) = previous
            && prev != key
        {
            sqlx::query("DELETE FROM flow_checkpoints WHERE checkpoint_key = $1")
                .bind(prev.as_bytes().as_slice())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db("replace"))?;
        }

        tx.commit().await.map_err(StoreError::db("replace"))?;
        Ok(())
    }
}
