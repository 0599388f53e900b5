// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable node runtime.
//!
//! [`NodeRuntime`] wires a checkpoint store and a network endpoint to a
//! [`StateMachineManager`] and boots it in the right order: checkpoints are
//! restored before the manager starts listening to the network, so replies to
//! restored flows are never dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowstate_core::checkpoint::SqliteCheckpointStore;
//! use flowstate_core::messaging::InMemoryNetwork;
//! use flowstate_core::runtime::NodeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteCheckpointStore::from_path(".data/node.db").await?);
//!     let network = InMemoryNetwork::new(false);
//!     let endpoint = Arc::new(network.create_node(false)?);
//!
//!     let runtime = NodeRuntime::builder()
//!         .storage(store)
//!         .network(endpoint)
//!         .register_flow::<MyFlow>()
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let handle = runtime.manager().add("flows.my", MyFlow::default())?;
//!     println!("{:?}", handle.result().await);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::flow::{FlowFactoryRegistry, FlowLogic};
use crate::manager::{ManagerOptions, StateMachineManager};
use crate::messaging::MessagingService;
use crate::services::{Clock, ServiceHub, SystemClock};

/// Builder for a [`NodeRuntime`].
pub struct NodeRuntimeBuilder {
    storage: Option<Arc<dyn CheckpointStore>>,
    network: Option<Arc<dyn MessagingService>>,
    clock: Arc<dyn Clock>,
    flows: FlowFactoryRegistry,
    options: ManagerOptions,
}

impl std::fmt::Debug for NodeRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeBuilder")
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .field("network", &self.network.as_ref().map(|n| n.my_address()))
            .field("flows", &self.flows)
            .field("options", &self.options)
            .finish()
    }
}

impl Default for NodeRuntimeBuilder {
    fn default() -> Self {
        Self {
            storage: None,
            network: None,
            clock: Arc::new(SystemClock),
            flows: FlowFactoryRegistry::new(),
            options: ManagerOptions::default(),
        }
    }
}

impl NodeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the checkpoint store (required).
    pub fn storage(mut self, storage: Arc<dyn CheckpointStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the network endpoint (required).
    pub fn network(mut self, network: Arc<dyn MessagingService>) -> Self {
        self.network = Some(network);
        self
    }

    /// Replace the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make `F` restorable from checkpoints.
    pub fn register_flow<F: FlowLogic>(mut self) -> Self {
        self.flows.register::<F>();
        self
    }

    /// Replace the whole flow registry.
    pub fn flows(mut self, flows: FlowFactoryRegistry) -> Self {
        self.flows = flows;
        self
    }

    /// Set manager options.
    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Take manager options from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.options(ManagerOptions::from(config))
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let storage = self
            .storage
            .ok_or_else(|| anyhow::anyhow!("storage is required"))?;
        let network = self
            .network
            .ok_or_else(|| anyhow::anyhow!("network is required"))?;
        if self.options.affinity_threads == 0 {
            anyhow::bail!("affinity_threads must be at least 1");
        }

        Ok(NodeRuntimeConfig {
            services: ServiceHub::new(storage, network).with_clock(self.clock),
            flows: self.flows,
            options: self.options,
        })
    }
}

/// Configuration for a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    services: ServiceHub,
    flows: FlowFactoryRegistry,
    options: ManagerOptions,
}

impl std::fmt::Debug for NodeRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeConfig")
            .field("node", &self.services.my_address)
            .field("flows", &self.flows)
            .field("options", &self.options)
            .finish()
    }
}

impl NodeRuntimeConfig {
    /// Restore checkpointed flows, then attach to the network.
    ///
    /// Any restore failure aborts startup.
    pub async fn start(self) -> Result<NodeRuntime> {
        let node = self.services.my_address.clone();
        let manager = StateMachineManager::new(self.services, self.flows, self.options);

        let restored = manager.start().await?;

        info!(node = %node, restored, "NodeRuntime started");
        Ok(NodeRuntime { manager, restored })
    }
}

/// A running node.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    manager: StateMachineManager,
    restored: usize,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    /// The manager running this node's flows.
    pub fn manager(&self) -> &StateMachineManager {
        &self.manager
    }

    /// How many flows were restored from checkpoints at startup.
    pub fn restored(&self) -> usize {
        self.restored
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.manager.is_shut_down()
    }

    /// Gracefully shut down: detach from the network and drain queued steps.
    pub async fn shutdown(self) {
        info!("NodeRuntime shutting down...");
        self.manager.shutdown().await;
        info!("NodeRuntime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::messaging::InMemoryNetwork;

    #[test]
    fn test_builder_requires_storage() {
        let network = InMemoryNetwork::new(false);
        let node = network.create_node(true).unwrap();
        let err = NodeRuntime::builder()
            .network(Arc::new(node))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("storage is required"));
    }

    #[test]
    fn test_builder_requires_network() {
        let err = NodeRuntime::builder()
            .storage(Arc::new(MemoryCheckpointStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("network is required"));
    }

    #[test]
    fn test_builder_rejects_zero_threads() {
        let network = InMemoryNetwork::new(false);
        let node = network.create_node(true).unwrap();
        let err = NodeRuntime::builder()
            .storage(Arc::new(MemoryCheckpointStore::new()))
            .network(Arc::new(node))
            .options(ManagerOptions {
                affinity_threads: 0,
                checkpointing: true,
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("affinity_threads"));
    }

    #[test]
    fn test_builder_debug() {
        let builder = NodeRuntime::builder();
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("NodeRuntimeBuilder"));
        assert!(debug_str.contains("affinity_threads"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_empty_node() {
        let network = InMemoryNetwork::new(false);
        let node = network.create_node(true).unwrap();
        let runtime = NodeRuntime::builder()
            .storage(Arc::new(MemoryCheckpointStore::new()))
            .network(Arc::new(node))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(runtime.restored(), 0);
        assert!(runtime.is_running());
        assert!(runtime.manager().all_state_machines().is_empty());
        runtime.shutdown().await;
    }
}
