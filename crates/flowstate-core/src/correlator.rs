// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routes inbound messages to the flow waiting on their topic.
//!
//! Each waiting flow registers a single-use handler on its full topic
//! (`topic.session`). Messages for a topic nobody is waiting on yet are held
//! in a per-topic buffer and handed to the next registration in arrival
//! order. A handler is taken out of the table before it runs, which is its
//! consumed guard: it can never fire twice, whatever the network redelivers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::message::Message;
use crate::messaging::{HandlerRegistration, MessagingService, TopicFilter};

/// How many message ids are remembered for de-duplication.
const SEEN_CAPACITY: usize = 16_384;

/// Single-use callback for a correlated message.
pub type ResponseHandler = Box<dyn FnOnce(Message) + Send>;

/// Identifies one pending registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(u64);

struct PendingHandler {
    id: CorrelationId,
    handler: ResponseHandler,
}

#[derive(Default)]
struct SeenIds {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
}

impl SeenIds {
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        true
    }
}

#[derive(Default)]
struct CorrelatorState {
    handlers: HashMap<String, VecDeque<PendingHandler>>,
    pending: HashMap<String, VecDeque<Message>>,
    seen: SeenIds,
}

/// Matches inbound messages to single-use handlers by topic.
#[derive(Clone, Default)]
pub struct MessageCorrelator {
    state: Arc<Mutex<CorrelatorState>>,
    next_id: Arc<AtomicU64>,
}

impl MessageCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a handler that fires once, for the next message on `topic`.
    ///
    /// If messages for `topic` are already buffered, the oldest one is handed
    /// to `handler` before this returns.
    pub fn register_once(&self, topic: &str, handler: ResponseHandler) -> CorrelationId {
        let id = CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let buffered = {
            let mut state = self.lock();
            let buffered = state.pending.get_mut(topic).and_then(VecDeque::pop_front);
            if state.pending.get(topic).is_some_and(VecDeque::is_empty) {
                state.pending.remove(topic);
            }
            if buffered.is_none() {
                state
                    .handlers
                    .entry(topic.to_string())
                    .or_default()
                    .push_back(PendingHandler { id, handler });
                return id;
            }
            buffered
        };

        if let Some(message) = buffered {
            trace!(topic, message = %message, "Delivering buffered message on registration");
            handler(message);
        }
        id
    }

    /// Drop a registration that has not fired yet. Returns whether it was found.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let mut state = self.lock();
        let mut found = false;
        state.handlers.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|h| h.id != id);
            found |= queue.len() != before;
            !queue.is_empty()
        });
        found
    }

    /// Hand `message` to the oldest handler registered on its topic, or buffer it.
    ///
    /// A message whose unique id was already seen is dropped.
    pub fn deliver(&self, message: Message) {
        let handler = {
            let mut state = self.lock();
            if !state.seen.insert(message.unique_id()) {
                debug!(message = %message, "Dropping redelivered message");
                return;
            }
            let topic = message.topic();
            let handler = state.handlers.get_mut(topic).and_then(VecDeque::pop_front);
            if state.handlers.get(topic).is_some_and(VecDeque::is_empty) {
                state.handlers.remove(topic);
            }
            match handler {
                Some(pending) => pending.handler,
                None => {
                    trace!(topic, "No handler registered, buffering message");
                    state
                        .pending
                        .entry(topic.to_string())
                        .or_default()
                        .push_back(message);
                    return;
                }
            }
        };
        handler(message);
    }

    /// Drop every registration that has not fired yet. Buffered messages are
    /// kept. Returns how many registrations were dropped.
    pub fn clear(&self) -> usize {
        let handlers = std::mem::take(&mut self.lock().handlers);
        handlers.values().map(VecDeque::len).sum()
    }

    /// Number of buffered messages waiting for a handler on `topic`.
    pub fn pending_count(&self, topic: &str) -> usize {
        self.lock().pending.get(topic).map_or(0, VecDeque::len)
    }

    /// Number of registered handlers that have not fired yet.
    pub fn registered_count(&self) -> usize {
        self.lock().handlers.values().map(VecDeque::len).sum()
    }

    /// Topics with at least one registered handler.
    pub fn registered_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.lock().handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscribe to every message on `messaging`.
    pub fn attach(&self, messaging: &dyn MessagingService) -> HandlerRegistration {
        let correlator = self.clone();
        messaging.add_message_handler(
            TopicFilter::Any,
            Arc::new(move |message: &Message, _: &HandlerRegistration| {
                correlator.deliver(message.clone());
            }),
        )
    }
}
