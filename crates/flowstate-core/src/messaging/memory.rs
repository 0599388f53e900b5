// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory messaging network for tests and single-process simulations.
//!
//! An [`InMemoryNetwork`] hands out [`InMemoryMessaging`] endpoints, one per
//! simulated node. Each endpoint owns a receive queue on the heap. A manually
//! pumped endpoint only delivers when [`InMemoryMessaging::pump_receive`] is
//! called; otherwise a background tokio task dispatches messages as they
//! arrive.
//!
//! Receive queues are created on demand when a message is addressed to a
//! peer, so a node that has not been created yet (or is being restarted)
//! still accumulates its traffic. Messages that reach an endpoint before any
//! handler matches them are parked and re-queued when a handler is added.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{HandlerRegistration, MessageCallback, MessagingService, TopicFilter};
use crate::error::{FlowError, Result};
use crate::message::{Message, PeerAddress};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A message in flight between two endpoints.
#[derive(Debug, Clone)]
pub struct MessageTransfer {
    /// Sending endpoint.
    pub sender: PeerAddress,
    /// The message itself.
    pub message: Message,
    /// Receiving endpoint.
    pub recipient: PeerAddress,
}

impl fmt::Display for MessageTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from '{}' to '{}'",
            self.message.topic(),
            self.sender,
            self.recipient
        )
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u32,
    stopped: bool,
    send_queue: VecDeque<MessageTransfer>,
    receive_queues: HashMap<u32, VecDeque<MessageTransfer>>,
    notifiers: HashMap<u32, Arc<Notify>>,
    endpoints: HashMap<u32, Weak<EndpointInner>>,
}

impl NetworkState {
    fn notifier(&mut self, id: u32) -> Arc<Notify> {
        self.notifiers.entry(id).or_default().clone()
    }
}

struct NetworkInner {
    send_manually_pumped: bool,
    state: Mutex<NetworkState>,
}

impl NetworkInner {
    fn enqueue_send(&self, transfer: MessageTransfer) {
        lock(&self.state).send_queue.push_back(transfer);
    }

    fn route(&self, transfer: MessageTransfer) {
        let notify = {
            let mut state = lock(&self.state);
            let id = transfer.recipient.id;
            state.receive_queues.entry(id).or_default().push_back(transfer);
            state.notifier(id)
        };
        notify.notify_one();
    }

    fn pop_received(&self, id: u32) -> Option<MessageTransfer> {
        lock(&self.state)
            .receive_queues
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
    }
}

/// A simulated network of in-process nodes.
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    /// Create a network.
    ///
    /// With `send_manually_pumped` set, sent messages wait in a shared queue
    /// until [`pump_send`](Self::pump_send) moves them to their recipient.
    pub fn new(send_manually_pumped: bool) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                send_manually_pumped,
                state: Mutex::new(NetworkState::default()),
            }),
        }
    }

    /// Create an endpoint with the next free id.
    ///
    /// Endpoints that are not manually pumped spawn a dispatcher task and
    /// must be created inside a tokio runtime.
    pub fn create_node(&self, manually_pumped: bool) -> Result<InMemoryMessaging> {
        let id = {
            let state = lock(&self.inner.state);
            if state.stopped {
                return Err(FlowError::ShutDown);
            }
            state.next_id
        };
        self.create_node_with_id(id, None, manually_pumped)
    }

    /// Create an endpoint at a fixed id, e.g. to simulate a node restart.
    ///
    /// Messages already queued for `id` are delivered to the new endpoint.
    pub fn create_node_with_id(
        &self,
        id: u32,
        description: Option<&str>,
        manually_pumped: bool,
    ) -> Result<InMemoryMessaging> {
        let address = PeerAddress::new(
            id,
            description
                .map(str::to_string)
                .unwrap_or_else(|| format!("In memory node {}", id)),
        );

        let mut state = lock(&self.inner.state);
        if state.stopped {
            return Err(FlowError::ShutDown);
        }
        state.next_id = state.next_id.max(id.saturating_add(1));
        state.receive_queues.entry(id).or_default();

        let endpoint = InMemoryMessaging {
            inner: Arc::new(EndpointInner {
                network: self.inner.clone(),
                address,
                manually_pumped,
                running: AtomicBool::new(true),
                handlers: Mutex::new(HandlerTable::default()),
                processed: Mutex::new(HashSet::new()),
                notify: state.notifier(id),
                dispatcher: Mutex::new(None),
                next_handler_id: AtomicU64::new(1),
            }),
        };
        state.endpoints.insert(id, Arc::downgrade(&endpoint.inner));
        drop(state);

        if !manually_pumped {
            endpoint.start_dispatcher();
        }
        debug!(node = %endpoint.inner.address, manually_pumped, "Created in-memory node");
        Ok(endpoint)
    }

    /// Move one message from the send queue to its recipient's receive queue.
    pub fn pump_send(&self) -> Option<MessageTransfer> {
        let transfer = lock(&self.inner.state).send_queue.pop_front()?;
        trace!(transfer = %transfer, "Pumped send");
        self.inner.route(transfer.clone());
        Some(transfer)
    }

    /// Pump every queued send. Returns how many were moved.
    pub fn pump_all_sends(&self) -> usize {
        let mut count = 0;
        while self.pump_send().is_some() {
            count += 1;
        }
        count
    }

    /// Number of sent messages not yet pumped.
    pub fn pending_sends(&self) -> usize {
        lock(&self.inner.state).send_queue.len()
    }

    /// Number of messages waiting in `peer`'s receive queue.
    pub fn queued_for(&self, peer: &PeerAddress) -> usize {
        lock(&self.inner.state)
            .receive_queues
            .get(&peer.id)
            .map_or(0, VecDeque::len)
    }

    /// Stop every endpoint and drop all queued traffic.
    pub fn stop(&self) {
        let endpoints: Vec<_> = {
            let mut state = lock(&self.inner.state);
            state.stopped = true;
            state.endpoints.values().filter_map(Weak::upgrade).collect()
        };
        for endpoint in endpoints {
            InMemoryMessaging { inner: endpoint }.stop();
        }
        let mut state = lock(&self.inner.state);
        state.endpoints.clear();
        state.receive_queues.clear();
        state.send_queue.clear();
    }
}

#[derive(Default)]
struct HandlerTable {
    handlers: Vec<(HandlerRegistration, MessageCallback)>,
    pending_redelivery: Vec<MessageTransfer>,
}

struct EndpointInner {
    network: Arc<NetworkInner>,
    address: PeerAddress,
    manually_pumped: bool,
    running: AtomicBool,
    handlers: Mutex<HandlerTable>,
    processed: Mutex<HashSet<Uuid>>,
    notify: Arc<Notify>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_handler_id: AtomicU64,
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryMessaging {
    inner: Arc<EndpointInner>,
}

impl InMemoryMessaging {
    /// Whether the endpoint still accepts traffic.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Deliver one message from this endpoint's receive queue.
    ///
    /// Messages no handler matches are parked for redelivery and skipped.
    /// Returns the transfer that was processed, or `None` if the queue ran
    /// dry.
    pub fn pump_receive(&self) -> Option<MessageTransfer> {
        if !self.is_running() {
            return None;
        }
        self.pump_receive_internal()
    }

    /// Deliver until the receive queue is empty. Returns how many messages
    /// were processed.
    pub fn pump_all(&self) -> usize {
        let mut count = 0;
        while self.pump_receive().is_some() {
            count += 1;
        }
        count
    }

    /// Number of messages parked because no handler matched them.
    pub fn pending_redelivery_count(&self) -> usize {
        lock(&self.inner.handlers).pending_redelivery.len()
    }

    /// Stop dispatching and detach from the network.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.inner.dispatcher).take() {
            task.abort();
        }
        let mut state = lock(&self.inner.network.state);
        let id = self.inner.address.id;
        let is_self = state
            .endpoints
            .get(&id)
            .and_then(Weak::upgrade)
            .is_some_and(|e| Arc::ptr_eq(&e, &self.inner));
        if is_self {
            state.endpoints.remove(&id);
        }
        debug!(node = %self.inner.address, "Stopped in-memory node");
    }

    fn start_dispatcher(&self) {
        let weak = Arc::downgrade(&self.inner);
        let notify = self.inner.notify.clone();
        let task = tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { break };
                let endpoint = InMemoryMessaging { inner };
                if !endpoint.is_running() {
                    break;
                }
                if endpoint.pump_receive_internal().is_none() {
                    drop(endpoint);
                    notify.notified().await;
                }
            }
        });
        *lock(&self.inner.dispatcher) = Some(task);
    }

    fn pump_receive_internal(&self) -> Option<MessageTransfer> {
        let inner = &self.inner;
        loop {
            let transfer = inner.network.pop_received(inner.address.id)?;

            let matching: Vec<_> = {
                let mut table = lock(&inner.handlers);
                let matching: Vec<_> = table
                    .handlers
                    .iter()
                    .filter(|(registration, _)| registration.filter.matches(transfer.message.topic()))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    trace!(
                        node = %inner.address,
                        topic = transfer.message.topic(),
                        "No handler yet, parking message for redelivery"
                    );
                    table.pending_redelivery.push(transfer);
                    continue;
                }
                matching
            };

            if !lock(&inner.processed).insert(transfer.message.unique_id()) {
                debug!(
                    node = %inner.address,
                    message = %transfer.message,
                    "Dropping duplicate delivery"
                );
                return Some(transfer);
            }

            trace!(node = %inner.address, transfer = %transfer, "Delivering");
            for (registration, callback) in &matching {
                callback(&transfer.message, registration);
            }
            return Some(transfer);
        }
    }
}

impl MessagingService for InMemoryMessaging {
    fn send(&self, message: Message, recipient: &PeerAddress) {
        if !self.is_running() {
            warn!(node = %self.inner.address, topic = message.topic(), "Send on stopped node dropped");
            return;
        }
        self.inner.network.enqueue_send(MessageTransfer {
            sender: self.inner.address.clone(),
            message,
            recipient: recipient.clone(),
        });
        if !self.inner.network.send_manually_pumped {
            let network = InMemoryNetwork {
                inner: self.inner.network.clone(),
            };
            network.pump_send();
        }
    }

    fn add_message_handler(
        &self,
        filter: TopicFilter,
        callback: MessageCallback,
    ) -> HandlerRegistration {
        let registration = HandlerRegistration {
            id: self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed),
            filter,
        };
        let parked = {
            let mut table = lock(&self.inner.handlers);
            table.handlers.push((registration.clone(), callback));
            std::mem::take(&mut table.pending_redelivery)
        };
        for transfer in parked {
            self.inner.network.route(transfer);
        }
        registration
    }

    fn remove_message_handler(&self, registration: &HandlerRegistration) {
        lock(&self.inner.handlers)
            .handlers
            .retain(|(r, _)| r.id != registration.id);
    }

    fn my_address(&self) -> PeerAddress {
        self.inner.address.clone()
    }
}

impl fmt::Debug for InMemoryMessaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMessaging")
            .field("address", &self.inner.address)
            .field("manually_pumped", &self.inner.manually_pumped)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collecting_handler() -> (MessageCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: MessageCallback = Arc::new(move |message: &Message, _: &HandlerRegistration| {
            sink.lock()
                .unwrap()
                .push(String::from_utf8(message.data().to_vec()).unwrap());
        });
        (callback, seen)
    }

    #[test]
    fn test_manual_pumping_delivers_in_order() {
        let network = InMemoryNetwork::new(true);
        let alice = network.create_node(true).unwrap();
        let bob = network.create_node(true).unwrap();

        let (callback, seen) = collecting_handler();
        bob.add_message_handler(TopicFilter::exact("greet.1"), callback);

        alice.send(alice.create_message("greet.1", b"one".to_vec()), &bob.my_address());
        alice.send(alice.create_message("greet.1", b"two".to_vec()), &bob.my_address());
        assert_eq!(network.pending_sends(), 2);
        assert!(bob.pump_receive().is_none());

        assert_eq!(network.pump_all_sends(), 2);
        assert_eq!(bob.pump_all(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_unmatched_messages_are_redelivered_when_handler_added() {
        let network = InMemoryNetwork::new(false);
        let alice = network.create_node(true).unwrap();
        let bob = network.create_node(true).unwrap();

        alice.send(alice.create_message("late.5", b"first".to_vec()), &bob.my_address());
        alice.send(alice.create_message("late.5", b"second".to_vec()), &bob.my_address());

        assert_eq!(bob.pump_all(), 0);
        assert_eq!(bob.pending_redelivery_count(), 2);

        let (callback, seen) = collecting_handler();
        bob.add_message_handler(TopicFilter::exact("late.5"), callback);
        assert_eq!(bob.pending_redelivery_count(), 0);
        assert_eq!(bob.pump_all(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_duplicate_ids_are_dropped() {
        let network = InMemoryNetwork::new(false);
        let alice = network.create_node(true).unwrap();
        let bob = network.create_node(true).unwrap();

        let (callback, seen) = collecting_handler();
        bob.add_message_handler(TopicFilter::Any, callback);

        let id = Uuid::new_v4();
        alice.send(Message::with_id("dup.1", b"x".to_vec(), id), &bob.my_address());
        alice.send(Message::with_id("dup.1", b"x".to_vec(), id), &bob.my_address());

        assert_eq!(bob.pump_all(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_queue_survives_node_restart() {
        let network = InMemoryNetwork::new(false);
        let alice = network.create_node(true).unwrap();
        let bob = network.create_node_with_id(7, Some("bob"), true).unwrap();
        let bob_address = bob.my_address();
        bob.stop();

        alice.send(alice.create_message("swap.2", b"done".to_vec()), &bob_address);
        assert_eq!(network.queued_for(&bob_address), 1);

        let bob = network.create_node_with_id(7, Some("bob"), true).unwrap();
        assert_eq!(bob.my_address(), bob_address);
        let (callback, seen) = collecting_handler();
        bob.add_message_handler(TopicFilter::Any, callback);
        assert_eq!(bob.pump_all(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["done"]);

        // Ids continue past explicitly chosen ones.
        let carol = network.create_node(true).unwrap();
        assert_eq!(carol.my_address().id, 8);
    }

    #[test]
    fn test_run_on_next_message_fires_once() {
        let network = InMemoryNetwork::new(false);
        let alice = network.create_node(true).unwrap();
        let bob = Arc::new(network.create_node(true).unwrap());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        bob.clone().run_on_next_message(
            "once.1",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        alice.send(alice.create_message("once.1", b"a".to_vec()), &bob.my_address());
        alice.send(alice.create_message("once.1", b"b".to_vec()), &bob.my_address());
        bob.pump_all();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The second message found no handler and is parked.
        assert_eq!(bob.pending_redelivery_count(), 1);
    }

    #[test]
    fn test_stopped_network_refuses_nodes() {
        let network = InMemoryNetwork::new(false);
        let node = network.create_node(true).unwrap();
        network.stop();
        assert!(!node.is_running());
        assert_eq!(network.create_node(true).unwrap_err(), FlowError::ShutDown);
    }

    #[tokio::test]
    async fn test_background_dispatcher_delivers() {
        let network = InMemoryNetwork::new(false);
        let alice = network.create_node(true).unwrap();
        let bob = network.create_node(false).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bob.add_message_handler(
            TopicFilter::exact("async.1"),
            Arc::new(move |message: &Message, _: &HandlerRegistration| {
                let _ = tx.send(message.data().to_vec());
            }),
        );

        alice.send(alice.create_message("async.1", b"hello".to_vec()), &bob.my_address());

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hello");
        bob.stop();
    }
}
