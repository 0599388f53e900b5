// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowstate node host.
//!
//! Boots a single node over the configured checkpoint store and an in-memory
//! network endpoint, restores any suspended flows and runs until Ctrl-C.
//! Applications embedding their own flows use [`NodeRuntime`] directly and
//! register their flow types on the builder.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use flowstate_core::checkpoint::{CheckpointStore, PostgresCheckpointStore, SqliteCheckpointStore};
use flowstate_core::config::Config;
use flowstate_core::messaging::InMemoryNetwork;
use flowstate_core::runtime::NodeRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowstate_core=info".parse()?),
        )
        .init();

    info!("Starting Flowstate node");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        node = %config.node_name,
        affinity_threads = config.affinity_threads,
        checkpointing = config.checkpointing,
        "Configuration loaded"
    );

    info!("Opening checkpoint store...");
    let storage: Arc<dyn CheckpointStore> = match config.sqlite_path() {
        Some(path) => Arc::new(SqliteCheckpointStore::from_path(path).await?),
        None => Arc::new(PostgresCheckpointStore::connect(&config.database_url).await?),
    };
    info!("Checkpoint store ready");

    let network = InMemoryNetwork::new(false);
    let endpoint = network.create_node_with_id(0, Some(&config.node_name), false)?;

    let runtime = NodeRuntime::builder()
        .storage(storage)
        .network(Arc::new(endpoint))
        .config(&config)
        .build()?
        .start()
        .await
        .map_err(|e| {
            error!("Startup failed: {:#}", e);
            e
        })?;

    info!(restored = runtime.restored(), "Flowstate node initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await;
    network.stop();
    info!("Shutdown complete");

    Ok(())
}
