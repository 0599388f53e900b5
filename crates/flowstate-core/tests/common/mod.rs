// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowstate-core integration tests.
//!
//! Provides manually pumped nodes on an in-memory network, a recording peer
//! and a handful of small flows.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowstate_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use flowstate_core::message::Envelope;
use flowstate_core::messaging::{
    HandlerRegistration, InMemoryMessaging, InMemoryNetwork, MessagingService, TopicFilter,
};
use flowstate_core::{
    FlowContext, FlowError, FlowFactoryRegistry, FlowLogic, FlowStep, ManagerOptions, Message,
    Payload, PeerAddress, Received, Result, ServiceHub, StateMachineManager, SuspensionRequest,
};

/// Upper bound for anything a test awaits.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A node running a manager over a manually pumped endpoint.
pub struct TestNode {
    pub endpoint: InMemoryMessaging,
    pub storage: Arc<dyn CheckpointStore>,
    pub manager: StateMachineManager,
}

impl TestNode {
    /// Start a node at `id`, restoring whatever `storage` holds.
    pub async fn start(network: &InMemoryNetwork, id: u32, storage: Arc<dyn CheckpointStore>) -> Self {
        Self::start_with(network, id, storage, registry()).await
    }

    /// Like [`start`](Self::start), with a custom flow registry.
    pub async fn start_with(
        network: &InMemoryNetwork,
        id: u32,
        storage: Arc<dyn CheckpointStore>,
        flows: FlowFactoryRegistry,
    ) -> Self {
        let endpoint = network
            .create_node_with_id(id, None, true)
            .expect("Failed to create node");
        let services = ServiceHub::new(storage.clone(), Arc::new(endpoint.clone()));
        let manager = StateMachineManager::new(services, flows, ManagerOptions::default());
        manager.start().await.expect("Failed to start manager");
        Self {
            endpoint,
            storage,
            manager,
        }
    }

    /// Start a node backed by a fresh memory store.
    pub async fn with_memory_store(network: &InMemoryNetwork, id: u32) -> (Self, MemoryCheckpointStore) {
        let store = MemoryCheckpointStore::new();
        let node = Self::start(network, id, Arc::new(store.clone())).await;
        (node, store)
    }

    pub fn address(&self) -> PeerAddress {
        self.endpoint.my_address()
    }

    /// Deliver everything queued for this node and run the resulting steps.
    pub async fn settle(&self) {
        loop {
            self.manager.flush().await;
            if self.endpoint.pump_all() == 0 {
                break;
            }
        }
        self.manager.flush().await;
    }

    /// Shut the manager down and detach the endpoint, leaving storage as is.
    pub async fn crash(self) {
        self.manager.shutdown().await;
        self.endpoint.stop();
    }
}

/// Every flow the tests may need to restore.
pub fn registry() -> FlowFactoryRegistry {
    let mut registry = FlowFactoryRegistry::new();
    registry
        .register::<Ping>()
        .register::<Swap>()
        .register::<AwaitText>()
        .register::<AwaitInt>()
        .register::<TwoReplies>()
        .register::<Responder>();
    registry
}

/// A plain endpoint that records every message it receives.
pub struct RecordingPeer {
    pub endpoint: InMemoryMessaging,
    pub inbox: Arc<Mutex<Vec<Message>>>,
    _registration: HandlerRegistration,
}

impl RecordingPeer {
    pub fn new(network: &InMemoryNetwork) -> Self {
        let endpoint = network.create_node(true).expect("Failed to create peer");
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        let registration = endpoint.add_message_handler(
            TopicFilter::Any,
            Arc::new(move |message: &Message, _: &HandlerRegistration| {
                sink.lock().unwrap().push(message.clone());
            }),
        );
        Self {
            endpoint,
            inbox,
            _registration: registration,
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.endpoint.my_address()
    }

    /// Pump the endpoint and take everything received so far.
    pub fn drain(&self) -> Vec<Message> {
        self.endpoint.pump_all();
        std::mem::take(&mut *self.inbox.lock().unwrap())
    }

    /// Send a tagged payload to `to` on the full topic `topic`.
    pub fn send<T: Payload>(&self, to: &PeerAddress, topic: &str, value: &T) -> Message {
        let message = self.endpoint.create_message(topic, encode(value));
        self.endpoint.send(message.clone(), to);
        message
    }
}

/// Poll `condition` until it holds, panicking after [`TIMEOUT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Condition not met within {:?}",
            TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Envelope bytes of `value`.
pub fn encode<T: Payload>(value: &T) -> Vec<u8> {
    Envelope::wrap(value).unwrap().to_bytes().unwrap()
}

/// Decode the payload of a received message.
pub fn decode<T: Payload>(message: &Message) -> T {
    Envelope::from_bytes(message.data())
        .unwrap()
        .unwrap_as::<T>(message.topic())
        .unwrap()
}

/// Sends one greeting on `ping.1` and finishes without waiting.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ping {
    pub target: PeerAddress,
    pub sent: bool,
}

impl FlowLogic for Ping {
    const NAME: &'static str = "tests.ping";
    type Output = ();

    fn step(&mut self, _: &FlowContext<'_>, _: Option<Received>) -> Result<FlowStep<()>> {
        if self.sent {
            return Ok(FlowStep::Finished(()));
        }
        self.sent = true;
        Ok(FlowStep::Suspend(SuspensionRequest::send(
            "ping",
            self.target.clone(),
            1,
            &"hello".to_string(),
        )?))
    }
}

/// Offers an amount on `swap.1` and finishes with the answer from `swap.2`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Swap {
    pub target: Option<PeerAddress>,
    pub amount: i32,
    pub offered: bool,
}

impl FlowLogic for Swap {
    const NAME: &'static str = "tests.swap";
    type Output = String;

    fn step(&mut self, _: &FlowContext<'_>, incoming: Option<Received>) -> Result<FlowStep<String>> {
        match incoming {
            None if !self.offered => {
                self.offered = true;
                Ok(FlowStep::Suspend(SuspensionRequest::send_and_receive::<String>(
                    "swap",
                    self.target.clone(),
                    1,
                    2,
                    &self.amount,
                )?))
            }
            Some(reply) => Ok(FlowStep::Finished(reply.payload::<String>()?.validate(Ok)?)),
            None => Err(FlowError::logic("swap resumed without an answer")),
        }
    }
}

/// Waits for a string on `topic.session`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AwaitText {
    pub topic: String,
    pub session: i64,
    pub waiting: bool,
}

impl AwaitText {
    pub fn new(topic: &str, session: i64) -> Self {
        Self {
            topic: topic.to_string(),
            session,
            waiting: false,
        }
    }
}

impl FlowLogic for AwaitText {
    const NAME: &'static str = "tests.await_text";
    type Output = String;

    fn step(&mut self, _: &FlowContext<'_>, incoming: Option<Received>) -> Result<FlowStep<String>> {
        match incoming {
            None if !self.waiting => {
                self.waiting = true;
                Ok(FlowStep::Suspend(SuspensionRequest::receive::<String>(
                    self.topic.clone(),
                    self.session,
                )))
            }
            Some(reply) => Ok(FlowStep::Finished(reply.payload::<String>()?.validate(Ok)?)),
            None => Err(FlowError::logic("stepped again without a reply")),
        }
    }
}

/// Waits for an integer on `topic.session`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AwaitInt {
    pub topic: String,
    pub session: i64,
    pub waiting: bool,
}

impl AwaitInt {
    pub fn new(topic: &str, session: i64) -> Self {
        Self {
            topic: topic.to_string(),
            session,
            waiting: false,
        }
    }
}

impl FlowLogic for AwaitInt {
    const NAME: &'static str = "tests.await_int";
    type Output = i32;

    fn step(&mut self, _: &FlowContext<'_>, incoming: Option<Received>) -> Result<FlowStep<i32>> {
        match incoming {
            None if !self.waiting => {
                self.waiting = true;
                Ok(FlowStep::Suspend(SuspensionRequest::receive::<i32>(
                    self.topic.clone(),
                    self.session,
                )))
            }
            Some(reply) => Ok(FlowStep::Finished(reply.payload::<i32>()?.validate(Ok)?)),
            None => Err(FlowError::logic("stepped again without a reply")),
        }
    }
}

/// Waits on `step.1` then on `step.2` and joins both answers.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TwoReplies {
    pub first: Option<String>,
    pub started: bool,
}

impl FlowLogic for TwoReplies {
    const NAME: &'static str = "tests.two_replies";
    type Output = String;

    fn step(&mut self, _: &FlowContext<'_>, incoming: Option<Received>) -> Result<FlowStep<String>> {
        match (incoming, self.first.take()) {
            (None, None) if !self.started => {
                self.started = true;
                Ok(FlowStep::Suspend(SuspensionRequest::receive::<String>("step", 1)))
            }
            (Some(reply), None) => {
                self.first = Some(reply.payload::<String>()?.validate(Ok)?);
                Ok(FlowStep::Suspend(SuspensionRequest::receive::<String>("step", 2)))
            }
            (Some(reply), Some(first)) => {
                let second = reply.payload::<String>()?.validate(Ok)?;
                Ok(FlowStep::Finished(format!("{}+{}", first, second)))
            }
            _ => Err(FlowError::logic("unexpected step")),
        }
    }
}

/// Answers one swap offer: waits for an `i32` on `swap.1`, replies on `swap.2`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Responder {
    pub counterparty: PeerAddress,
    pub received: Option<i32>,
    pub answered: bool,
}

impl Responder {
    pub fn new(counterparty: PeerAddress) -> Self {
        Self {
            counterparty,
            received: None,
            answered: false,
        }
    }
}

impl FlowLogic for Responder {
    const NAME: &'static str = "tests.responder";
    type Output = i32;

    fn step(&mut self, _: &FlowContext<'_>, incoming: Option<Received>) -> Result<FlowStep<i32>> {
        if let Some(offer) = incoming {
            let amount = offer
                .payload::<i32>()?
                .validate(|amount| match amount {
                    a if a > 0 => Ok(a),
                    _ => Err(FlowError::logic("offer must be positive")),
                })?;
            self.received = Some(amount);
            return Ok(FlowStep::Suspend(SuspensionRequest::send(
                "swap",
                self.counterparty.clone(),
                2,
                &"done".to_string(),
            )?));
        }
        match self.received {
            Some(amount) if !self.answered => {
                self.answered = true;
                Ok(FlowStep::Finished(amount))
            }
            None => Ok(FlowStep::Suspend(SuspensionRequest::receive::<i32>("swap", 1))),
            Some(_) => Err(FlowError::logic("responder stepped after answering")),
        }
    }
}
