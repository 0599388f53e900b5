// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The messaging service contract consumed by the manager.
//!
//! Delivery is topic addressed, best effort reliable, and possibly reordered.
//! Handlers are invoked once per delivered message whose topic matches their
//! filter. Implementations must not hold internal locks while invoking a
//! handler, since handlers may register or remove handlers themselves.

pub mod memory;

pub use self::memory::{InMemoryMessaging, InMemoryNetwork};

use std::sync::{Arc, Mutex};

use crate::message::{Message, PeerAddress};

/// Which topics a handler wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Every message.
    Any,
    /// Messages whose full topic equals the given string.
    Exact(String),
}

impl TopicFilter {
    /// Filter for one full topic.
    pub fn exact(topic: impl Into<String>) -> Self {
        Self::Exact(topic.into())
    }

    /// Whether `topic` passes this filter.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => t == topic,
        }
    }
}

/// Handle returned by [`MessagingService::add_message_handler`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRegistration {
    /// Endpoint-unique id.
    pub id: u64,
    /// The filter the handler was registered with.
    pub filter: TopicFilter,
}

/// Callback invoked for each matching message.
pub type MessageCallback = Arc<dyn Fn(&Message, &HandlerRegistration) + Send + Sync>;

/// Topic-addressed message transport.
pub trait MessagingService: Send + Sync + 'static {
    /// Queue `message` for delivery to `recipient`. No acknowledgement.
    fn send(&self, message: Message, recipient: &PeerAddress);

    /// Register `callback` for every delivered message matching `filter`.
    fn add_message_handler(
        &self,
        filter: TopicFilter,
        callback: MessageCallback,
    ) -> HandlerRegistration;

    /// Unregister a handler. Unknown registrations are ignored.
    fn remove_message_handler(&self, registration: &HandlerRegistration);

    /// This endpoint's own address.
    fn my_address(&self) -> PeerAddress;

    /// Build a message with a fresh id and timestamp.
    fn create_message(&self, topic: &str, data: Vec<u8>) -> Message {
        Message::new(topic, data)
    }

    /// Fire `callback` for the next message on `topic`, then unregister.
    fn run_on_next_message(
        self: Arc<Self>,
        topic: &str,
        callback: Box<dyn FnOnce(Message) + Send>,
    ) -> HandlerRegistration {
        let slot = Mutex::new(Some(callback));
        let service = Arc::downgrade(&self);
        self.add_message_handler(
            TopicFilter::exact(topic),
            Arc::new(move |message: &Message, registration: &HandlerRegistration| {
                let callback = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(callback) = callback {
                    if let Some(service) = service.upgrade() {
                        service.remove_message_handler(registration);
                    }
                    callback(message.clone());
                }
            }),
        )
    }
}
