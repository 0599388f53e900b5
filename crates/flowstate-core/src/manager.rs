// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The state machine manager.
//!
//! Owns the flow registry and drives every flow through its steps on the
//! affinity executor:
//!
//! 1. [`add`](StateMachineManager::add) registers the flow and schedules its
//!    first step.
//! 2. Each step either finishes the flow or yields a [`SuspensionRequest`].
//!    Outgoing payloads are sent on `topic.send_session_id`. A send that
//!    expects no answer loops straight into the next step.
//! 3. A request expecting a response is checkpointed (replacing the flow's
//!    previous checkpoint) and a single-use correlator handler is registered
//!    on `topic.receive_session_id`.
//! 4. When the reply arrives its type tag is checked against the one in the
//!    checkpoint and the flow is stepped again with it.
//! 5. On termination the last checkpoint is deleted, the flow leaves the
//!    registry and its result handle completes.
//!
//! Errors raised by flow logic, type mismatches and storage failures all end
//! the flow as [`FlowStatus::Failed`]. Nothing is retried.
//!
//! [`SuspensionRequest`]: crate::flow::SuspensionRequest

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::{self, Checkpoint, CheckpointKey};
use crate::config::Config;
use crate::correlator::MessageCorrelator;
use crate::error::{FlowError, Result, StartupError};
use crate::executor::AffinityExecutor;
use crate::flow::{
    ErasedFlow, FlowAdapter, FlowFactoryRegistry, FlowLogic, Received, ResultHandle, StepOutcome,
};
use crate::message::{Envelope, Message, PeerAddress, TopicSession};
use crate::messaging::HandlerRegistration;
use crate::metrics::{FlowMetrics, MetricsSnapshot};
use crate::services::{FlowContext, ServiceHub};

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Identifies one run of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowRunId(Uuid);

impl FlowRunId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FlowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FlowRunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for FlowRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Running or scheduled to run.
    Active,
    /// Checkpointed and waiting for a reply.
    Suspended,
    /// Finished successfully.
    Terminated,
    /// Finished with an error.
    Failed,
}

impl FlowStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry view of one live flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSnapshot {
    /// Run id.
    pub run_id: FlowRunId,
    /// Registered flow type name.
    pub flow_name: &'static str,
    /// Name the flow logs under.
    pub logger_name: String,
    /// Current state.
    pub status: FlowStatus,
    /// Key of the current checkpoint, while suspended.
    pub checkpoint_key: Option<CheckpointKey>,
    /// Full topic the flow last waited on.
    pub awaiting_topic: Option<String>,
}

/// What happened to a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowChangeKind {
    /// Entered the registry (added or restored).
    Added,
    /// Left the registry with the given terminal status.
    Removed(FlowStatus),
}

/// A registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowChange {
    /// Run id.
    pub run_id: FlowRunId,
    /// Registered flow type name.
    pub flow_name: &'static str,
    /// The change.
    pub kind: FlowChangeKind,
}

/// Tunables for a manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Number of affinity executor workers.
    pub affinity_threads: usize,
    /// Whether checkpoints are written to storage.
    pub checkpointing: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            affinity_threads: 1,
            checkpointing: true,
        }
    }
}

impl From<&Config> for ManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            affinity_threads: config.affinity_threads,
            checkpointing: config.checkpointing,
        }
    }
}

struct RegistryEntry {
    flow_name: &'static str,
    logger_name: String,
    status: FlowStatus,
    checkpoint_key: Option<CheckpointKey>,
    awaiting_topic: Option<String>,
    logic_type: TypeId,
    handle: Arc<dyn Any + Send + Sync>,
}

impl RegistryEntry {
    fn snapshot(&self, run_id: FlowRunId) -> FlowSnapshot {
        FlowSnapshot {
            run_id,
            flow_name: self.flow_name,
            logger_name: self.logger_name.clone(),
            status: self.status,
            checkpoint_key: self.checkpoint_key,
            awaiting_topic: self.awaiting_topic.clone(),
        }
    }
}

/// A flow moving between executor jobs and correlator handlers.
struct FlowInstance {
    run_id: FlowRunId,
    logger_name: String,
    flow: Box<dyn ErasedFlow>,
}

struct Inner {
    services: ServiceHub,
    executor: AffinityExecutor,
    correlator: MessageCorrelator,
    factories: FlowFactoryRegistry,
    registry: Mutex<HashMap<FlowRunId, RegistryEntry>>,
    changes: broadcast::Sender<FlowChange>,
    metrics: FlowMetrics,
    checkpointing: bool,
    shut_down: AtomicBool,
    attachment: Mutex<Option<HandlerRegistration>>,
}

/// Runs flows, checkpoints them while they wait and resumes them on reply.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct StateMachineManager {
    inner: Arc<Inner>,
}

impl StateMachineManager {
    /// Create a manager. Must be called inside a tokio runtime.
    ///
    /// The manager does not listen to the network until
    /// [`attach`](Self::attach) (or [`start`](Self::start)) is called.
    pub fn new(
        services: ServiceHub,
        factories: FlowFactoryRegistry,
        options: ManagerOptions,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                services,
                executor: AffinityExecutor::new(options.affinity_threads),
                correlator: MessageCorrelator::new(),
                factories,
                registry: Mutex::new(HashMap::new()),
                changes,
                metrics: FlowMetrics::new(),
                checkpointing: options.checkpointing,
                shut_down: AtomicBool::new(false),
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Restore checkpointed flows, then start listening to the network.
    pub async fn start(&self) -> std::result::Result<usize, StartupError> {
        let restored = self.restore_checkpoints().await?;
        self.attach();
        Ok(restored)
    }

    /// Start and run a new flow.
    ///
    /// The flow is in the registry before this returns, even if it finishes
    /// immediately.
    pub fn add<F: FlowLogic>(
        &self,
        logger_name: impl Into<String>,
        logic: F,
    ) -> Result<ResultHandle<F::Output>> {
        if self.is_shut_down() {
            return Err(FlowError::ShutDown);
        }
        let run_id = FlowRunId::new();
        let adapter = FlowAdapter::new(run_id, logic);
        let handle = adapter.result_handle();
        let instance = FlowInstance {
            run_id,
            logger_name: logger_name.into(),
            flow: Box::new(adapter),
        };

        info!(run_id = %run_id, flow = F::NAME, logger = %instance.logger_name, "Flow added");
        self.inner.register(&instance, FlowStatus::Active, None, None);

        let inner = self.inner.clone();
        if let Err(e) = self
            .inner
            .executor
            .execute(async move { inner.iterate(instance, None, None).await })
        {
            self.inner.deregister(run_id, FlowStatus::Failed);
            return Err(e);
        }
        Ok(handle)
    }

    /// Rebuild every checkpointed flow and wait for its reply again.
    ///
    /// No flow logic runs. All checkpoints are decoded before any flow is
    /// registered, so a fatal error leaves the registry untouched.
    #[instrument(skip(self))]
    pub async fn restore_checkpoints(&self) -> std::result::Result<usize, StartupError> {
        let blobs = self.inner.services.storage.all().await?;

        let mut decoded = Vec::with_capacity(blobs.len());
        for bytes in blobs {
            let key = CheckpointKey::of(&bytes);
            let checkpoint =
                Checkpoint::from_bytes(&bytes).map_err(|e| StartupError::CorruptCheckpoint {
                    key: key.to_hex(),
                    details: e.to_string(),
                })?;
            let flow = self
                .inner
                .factories
                .restore(
                    &checkpoint.flow_name,
                    checkpoint.run_id,
                    checkpoint.flow_state.clone(),
                )
                .ok_or_else(|| StartupError::UnknownFlow {
                    key: key.to_hex(),
                    flow_name: checkpoint.flow_name.clone(),
                })?
                .map_err(|e| StartupError::CorruptCheckpoint {
                    key: key.to_hex(),
                    details: e.to_string(),
                })?;
            decoded.push((key, checkpoint, flow));
        }

        let mut restored = 0;
        for (key, checkpoint, flow) in decoded {
            if self.inner.lock_registry().contains_key(&checkpoint.run_id) {
                warn!(run_id = %checkpoint.run_id, "Flow already live, skipping checkpoint");
                continue;
            }
            let instance = FlowInstance {
                run_id: checkpoint.run_id,
                logger_name: checkpoint.logger_name,
                flow,
            };
            debug!(
                run_id = %instance.run_id,
                logger = %instance.logger_name,
                topic = %checkpoint.awaiting_topic,
                "Restored flow from checkpoint"
            );
            self.inner.register(
                &instance,
                FlowStatus::Suspended,
                Some(key),
                Some(checkpoint.awaiting_topic.clone()),
            );
            self.inner.await_response(
                instance,
                key,
                checkpoint.awaiting_topic,
                checkpoint.awaiting_type,
            );
            restored += 1;
        }

        info!(restored, "Checkpoint restore complete");
        Ok(restored)
    }

    /// Subscribe the correlator to the node's network endpoint. Idempotent.
    pub fn attach(&self) {
        let mut attachment = self
            .inner
            .attachment
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if attachment.is_none() && !self.is_shut_down() {
            *attachment = Some(self.inner.correlator.attach(self.inner.services.network.as_ref()));
            debug!(node = %self.inner.services.my_address, "Correlator attached to network");
        }
    }

    /// Live flows of type `F`, restored ones included.
    pub fn find_state_machines<F: FlowLogic>(&self) -> Vec<(FlowRunId, ResultHandle<F::Output>)> {
        let wanted = TypeId::of::<F>();
        let registry = self.inner.lock_registry();
        let mut found: Vec<_> = registry
            .iter()
            .filter(|(_, entry)| entry.logic_type == wanted)
            .filter_map(|(run_id, entry)| {
                entry
                    .handle
                    .downcast_ref::<ResultHandle<F::Output>>()
                    .map(|handle| (*run_id, handle.clone()))
            })
            .collect();
        found.sort_by_key(|(run_id, _)| *run_id);
        found
    }

    /// Snapshot of every live flow.
    pub fn all_state_machines(&self) -> Vec<FlowSnapshot> {
        let registry = self.inner.lock_registry();
        let mut all: Vec<_> = registry
            .iter()
            .map(|(run_id, entry)| entry.snapshot(*run_id))
            .collect();
        all.sort_by_key(|snapshot| snapshot.run_id);
        all
    }

    /// Snapshot of one flow, if it is still live.
    pub fn state_machine(&self, run_id: FlowRunId) -> Option<FlowSnapshot> {
        self.inner
            .lock_registry()
            .get(&run_id)
            .map(|entry| entry.snapshot(run_id))
    }

    /// Registry change notifications from now on.
    pub fn changes(&self) -> broadcast::Receiver<FlowChange> {
        self.inner.changes.subscribe()
    }

    /// The current registry and a receiver for every later change, taken
    /// atomically.
    pub fn track(&self) -> (Vec<FlowSnapshot>, broadcast::Receiver<FlowChange>) {
        let registry = self.inner.lock_registry();
        let receiver = self.inner.changes.subscribe();
        let mut all: Vec<_> = registry
            .iter()
            .map(|(run_id, entry)| entry.snapshot(*run_id))
            .collect();
        all.sort_by_key(|snapshot| snapshot.run_id);
        (all, receiver)
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let in_flight = self.inner.lock_registry().len();
        self.inner.metrics.snapshot(in_flight)
    }

    /// The correlator, for diagnostics.
    pub fn correlator(&self) -> &MessageCorrelator {
        &self.inner.correlator
    }

    /// Services handed to flows.
    pub fn services(&self) -> &ServiceHub {
        &self.inner.services
    }

    /// Wait until every queued step has run.
    pub async fn flush(&self) {
        self.inner.executor.flush().await;
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stop accepting flows, detach from the network and drain queued steps.
    ///
    /// Suspended flows keep their checkpoints and are picked up by the next
    /// [`restore_checkpoints`](Self::restore_checkpoints). Their result
    /// handles in this process resolve with [`FlowError::ShutDown`].
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let attachment = self
            .inner
            .attachment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(registration) = attachment {
            self.inner
                .services
                .network
                .remove_message_handler(&registration);
        }
        self.inner.executor.shutdown().await;
        let dropped = self.inner.correlator.clear();
        info!(suspended = dropped, "State machine manager shut down");
    }
}

impl Inner {
    fn lock_registry(&self) -> MutexGuard<'_, HashMap<FlowRunId, RegistryEntry>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        instance: &FlowInstance,
        status: FlowStatus,
        checkpoint_key: Option<CheckpointKey>,
        awaiting_topic: Option<String>,
    ) {
        let flow_name = instance.flow.flow_name();
        let mut registry = self.lock_registry();
        registry.insert(
            instance.run_id,
            RegistryEntry {
                flow_name,
                logger_name: instance.logger_name.clone(),
                status,
                checkpoint_key,
                awaiting_topic,
                logic_type: instance.flow.logic_type(),
                handle: instance.flow.handle(),
            },
        );
        let _ = self.changes.send(FlowChange {
            run_id: instance.run_id,
            flow_name,
            kind: FlowChangeKind::Added,
        });
        drop(registry);
        self.metrics.flow_started();
    }

    fn deregister(&self, run_id: FlowRunId, status: FlowStatus) -> Option<RegistryEntry> {
        let mut registry = self.lock_registry();
        let entry = registry.remove(&run_id)?;
        let _ = self.changes.send(FlowChange {
            run_id,
            flow_name: entry.flow_name,
            kind: FlowChangeKind::Removed(status),
        });
        Some(entry)
    }

    fn update(&self, run_id: FlowRunId, apply: impl FnOnce(&mut RegistryEntry)) {
        if let Some(entry) = self.lock_registry().get_mut(&run_id) {
            apply(entry);
        }
    }

    /// Step a flow until it finishes or suspends. Runs on the executor.
    async fn iterate(
        self: &Arc<Self>,
        mut instance: FlowInstance,
        mut incoming: Option<Received>,
        previous: Option<CheckpointKey>,
    ) {
        loop {
            self.update(instance.run_id, |entry| entry.status = FlowStatus::Active);

            let outcome = {
                let ctx = FlowContext::new(instance.run_id, &instance.logger_name, &self.services);
                instance.flow.step(&ctx, incoming.take())
            };

            let request = match outcome {
                Ok(StepOutcome::Finished) => return self.finish(instance, previous, Ok(())).await,
                Err(e) => return self.finish(instance, previous, Err(e)).await,
                Ok(StepOutcome::Suspend(request)) => request,
            };

            if let Some((topic, destination, payload)) = request.outgoing() {
                let sent = match destination {
                    Some(destination) => self.send(&topic, destination, payload),
                    None => Err(FlowError::MissingDestination {
                        topic: topic.to_string(),
                    }),
                };
                if let Err(e) = sent {
                    return self.finish(instance, previous, Err(e)).await;
                }
            }

            let Some((topic, expected)) = request.awaiting() else {
                continue;
            };
            let expected = expected.to_string();
            return self.suspend(instance, previous, topic, expected).await;
        }
    }

    fn send(
        &self,
        topic: &TopicSession,
        destination: &PeerAddress,
        payload: &Envelope,
    ) -> Result<()> {
        let network = &self.services.network;
        let message = network.create_message(&topic.to_string(), payload.to_bytes()?);
        debug!(topic = %topic, destination = %destination, message = %message, "Sending");
        network.send(message, destination);
        Ok(())
    }

    /// Checkpoint a flow and park it until its reply arrives.
    async fn suspend(
        self: &Arc<Self>,
        instance: FlowInstance,
        previous: Option<CheckpointKey>,
        topic: TopicSession,
        expected: String,
    ) {
        let topic = topic.to_string();
        let encoded = self.encode_checkpoint(&instance, &topic, &expected);
        let stored = match encoded {
            Ok(bytes) => self.store_checkpoint(previous, bytes).await,
            Err(e) => Err(e),
        };
        let key = match stored {
            Ok(key) => key,
            Err(e) => return self.finish(instance, previous, Err(e)).await,
        };

        self.update(instance.run_id, |entry| {
            entry.status = FlowStatus::Suspended;
            entry.checkpoint_key = Some(key);
            entry.awaiting_topic = Some(topic.clone());
        });
        debug!(
            run_id = %instance.run_id,
            logger = %instance.logger_name,
            topic = %topic,
            expected = %expected,
            checkpoint = %key,
            "Flow suspended"
        );
        self.await_response(instance, key, topic, expected);
    }

    fn encode_checkpoint(
        &self,
        instance: &FlowInstance,
        topic: &str,
        expected: &str,
    ) -> Result<Vec<u8>> {
        Checkpoint {
            run_id: instance.run_id,
            flow_name: instance.flow.flow_name().to_string(),
            logger_name: instance.logger_name.clone(),
            awaiting_topic: topic.to_string(),
            awaiting_type: expected.to_string(),
            flow_state: instance.flow.snapshot()?,
            created_at: self.services.clock.now(),
        }
        .to_bytes()
    }

    async fn store_checkpoint(
        &self,
        previous: Option<CheckpointKey>,
        bytes: Vec<u8>,
    ) -> Result<CheckpointKey> {
        if !self.checkpointing {
            return Ok(CheckpointKey::of(&bytes));
        }
        let key =
            checkpoint::persist(self.services.storage.as_ref(), previous.as_ref(), &bytes).await?;
        self.metrics.checkpoint_written();
        Ok(key)
    }

    /// Register the correlator entry that resumes `instance`.
    fn await_response(
        self: &Arc<Self>,
        instance: FlowInstance,
        key: CheckpointKey,
        topic: String,
        expected: String,
    ) {
        let run_id = instance.run_id;
        let weak = Arc::downgrade(self);
        self.correlator.register_once(
            &topic,
            Box::new(move |message: Message| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let job = inner.clone();
                let scheduled = inner
                    .executor
                    .execute(async move { job.resume(instance, message, key, expected).await });
                if let Err(e) = scheduled {
                    warn!(run_id = %run_id, error = %e, "Reply arrived after shutdown, flow stays checkpointed");
                }
            }),
        );
    }

    /// Check a reply against the awaited type and step the flow with it.
    async fn resume(
        self: &Arc<Self>,
        instance: FlowInstance,
        message: Message,
        key: CheckpointKey,
        expected: String,
    ) {
        let topic = message.topic().to_string();
        let received = Envelope::from_bytes(message.data()).and_then(|envelope| {
            if envelope.type_tag == expected {
                Ok(Received::new(topic.clone(), envelope, message.unique_id()))
            } else {
                Err(FlowError::ProtocolMismatch {
                    topic: topic.clone(),
                    expected: expected.clone(),
                    actual: envelope.type_tag,
                })
            }
        });

        match received {
            Ok(received) => self.iterate(instance, Some(received), Some(key)).await,
            Err(e) => self.finish(instance, Some(key), Err(e)).await,
        }
    }

    /// Terminal transition: delete the checkpoint, deregister, complete the handle.
    async fn finish(
        &self,
        mut instance: FlowInstance,
        previous: Option<CheckpointKey>,
        outcome: Result<()>,
    ) {
        let mut outcome = outcome;
        if self.checkpointing
            && let Some(key) = previous
            && let Err(e) = self.services.storage.remove(&key).await
        {
            error!(
                run_id = %instance.run_id,
                logger = %instance.logger_name,
                checkpoint = %key,
                error = %e,
                "Failed to delete checkpoint of finished flow"
            );
            if outcome.is_ok() {
                outcome = Err(e.into());
            }
        }

        let status = match outcome {
            Ok(()) => FlowStatus::Terminated,
            Err(_) => FlowStatus::Failed,
        };
        let entry = self.deregister(instance.run_id, status);
        self.metrics.flow_finished();

        match outcome {
            Ok(()) => {
                info!(run_id = %instance.run_id, logger = %instance.logger_name, "Flow finished");
                instance.flow.complete();
            }
            Err(e) => {
                let topic = entry
                    .and_then(|entry| entry.awaiting_topic)
                    .unwrap_or_else(|| "-".to_string());
                error!(
                    run_id = %instance.run_id,
                    logger = %instance.logger_name,
                    topic = %topic,
                    code = e.error_code(),
                    error = %e,
                    "Flow failed"
                );
                instance.flow.fail(e);
            }
        }
    }
}
