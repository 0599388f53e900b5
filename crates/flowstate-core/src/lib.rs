// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowstate Core - Checkpointed Flow State Machines
//!
//! This crate runs multi-party flows: long-lived state machines that exchange
//! typed messages with peer nodes. A flow that waits for a reply is
//! checkpointed, so it survives a node restart and resumes exactly where it
//! left off once the reply arrives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Application code                                │
//! │               (FlowLogic implementations, result handles)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ add / find / track
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       StateMachineManager                                │
//! │        (registry, change feed, metrics, checkpoint lifecycle)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │ steps                  │ waits                    │ persists
//!        ▼                        ▼                          ▼
//! ┌──────────────────┐  ┌────────────────────┐   ┌──────────────────────────┐
//! │ AffinityExecutor │  │ MessageCorrelator  │   │     CheckpointStore      │
//! │ (tokio workers)  │  │ (topic.session →   │   │ (memory, SQLite,         │
//! │                  │  │  single-use hook)  │   │  PostgreSQL)             │
//! └──────────────────┘  └────────────────────┘   └──────────────────────────┘
//!                                 ▲
//!                                 │ every inbound message
//!                       ┌────────────────────┐
//!                       │  MessagingService  │
//!                       │ (in-memory network)│
//!                       └────────────────────┘
//! ```
//!
//! # Flow Lifecycle
//!
//! ```text
//!            add                     reply on awaited topic
//!   ────────────────► ACTIVE ◄──────────────────────────────┐
//!                       │                                    │
//!        ┌──────────────┼───────────────┐                    │
//!        │ finished     │ error         │ expects response   │
//!        ▼              ▼               ▼                    │
//!   ┌────────────┐ ┌────────┐     ┌───────────┐              │
//!   │ TERMINATED │ │ FAILED │     │ SUSPENDED │──────────────┘
//!   └────────────┘ └────────┘     └───────────┘
//!                                  (checkpointed)
//! ```
//!
//! A send that expects no response loops straight back into the next step
//! without touching storage. Restored flows re-enter as `SUSPENDED`.
//!
//! ## Checkpoint Semantics
//!
//! 1. A checkpoint is keyed by the SHA-256 of its serialized bytes.
//! 2. Each suspension atomically replaces the flow's previous checkpoint.
//! 3. A terminal flow's last checkpoint is deleted before its result is
//!    published.
//! 4. On startup every checkpoint is decoded before any flow is registered;
//!    an unreadable checkpoint or an unregistered flow name aborts startup.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FLOWSTATE_DATABASE_URL` | No | `sqlite:.data/flowstate.db` | Checkpoint store URL (SQLite or PostgreSQL) |
//! | `FLOWSTATE_AFFINITY_THREADS` | No | `1` | Affinity executor workers |
//! | `FLOWSTATE_CHECKPOINTING` | No | `true` | Write checkpoints to storage |
//! | `FLOWSTATE_NODE_NAME` | No | `node` | Peer description of this node |
//!
//! # Modules
//!
//! - [`checkpoint`]: Checkpoint records and stores
//! - [`config`]: Node configuration from environment variables
//! - [`correlator`]: Topic-based routing of replies to waiting flows
//! - [`error`]: Error types with stable error codes
//! - [`executor`]: The affinity executor
//! - [`flow`]: The flow contract and result handles
//! - [`manager`]: The state machine manager
//! - [`message`]: Messages, addresses and typed payloads
//! - [`messaging`]: Network abstraction and the in-memory network
//! - [`metrics`]: Manager counters
//! - [`runtime`]: Node runtime builder
//! - [`services`]: Services handed to flows

#![deny(missing_docs)]

/// Checkpoint records and the stores they are persisted in.
pub mod checkpoint;

/// Node configuration loaded from environment variables.
pub mod config;

/// Correlates inbound messages with waiting flows.
pub mod correlator;

/// Error types with stable error codes.
pub mod error;

/// The affinity executor flow steps run on.
pub mod executor;

/// The flow contract, suspension requests and result handles.
pub mod flow;

/// The state machine manager.
pub mod manager;

/// Messages, peer addresses and typed payloads.
pub mod message;

/// Network abstraction and the in-memory network.
pub mod messaging;

/// Manager counters.
pub mod metrics;

/// Node runtime builder.
pub mod runtime;

/// Clock and node services available to flows.
pub mod services;

pub use error::{FlowError, Result, StartupError, StoreError};
pub use flow::{FlowFactoryRegistry, FlowLogic, FlowStep, Received, ResultHandle, SuspensionRequest};
pub use manager::{FlowRunId, FlowStatus, ManagerOptions, StateMachineManager};
pub use message::{Message, Payload, PeerAddress};
pub use runtime::NodeRuntime;
pub use services::{FlowContext, ServiceHub};
