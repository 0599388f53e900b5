// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages, addressing, and the typed payload envelope.
//!
//! Payloads travel as a small JSON document carrying an explicit type tag:
//!
//! ```json
//! { "type_tag": "String", "body": "done" }
//! ```
//!
//! The tag is what a suspended flow's checkpoint records as the expected
//! response type, and incoming messages are matched against it by equality.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;

/// A message as handed to and received from the messaging service.
///
/// Immutable once created; use [`MessagingService::create_message`] to build one.
///
/// [`MessagingService::create_message`]: crate::messaging::MessagingService::create_message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    data: Vec<u8>,
    debug_timestamp: DateTime<Utc>,
    unique_id: Uuid,
}

impl Message {
    /// Create a message with a fresh unique id and the current timestamp.
    pub fn new(topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self::with_id(topic, data, Uuid::new_v4())
    }

    /// Create a message with an explicit unique id (for redelivery simulations).
    pub fn with_id(topic: impl Into<String>, data: Vec<u8>, unique_id: Uuid) -> Self {
        Self {
            topic: topic.into(),
            data,
            debug_timestamp: Utc::now(),
            unique_id,
        }
    }

    /// The full topic, including the session suffix.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// When the message was created.
    pub fn debug_timestamp(&self) -> DateTime<Utc> {
        self.debug_timestamp
    }

    /// Id used to drop duplicate deliveries.
    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.unique_id)
    }
}

/// A topic plus the session id that scopes one leg of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSession {
    /// Topic namespace, e.g. `"swap"`.
    pub topic: String,
    /// Session id, e.g. `2`.
    pub session_id: i64,
}

impl TopicSession {
    /// Create a new topic/session pair.
    pub fn new(topic: impl Into<String>, session_id: i64) -> Self {
        Self {
            topic: topic.into(),
            session_id,
        }
    }
}

impl fmt::Display for TopicSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.topic, self.session_id)
    }
}

/// Address of a peer node on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Numeric handle, stable across simulated restarts.
    pub id: u32,
    /// Human-readable description used in logs.
    pub description: String,
}

impl PeerAddress {
    /// Create a new peer address.
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// A value that can travel between flows.
///
/// `TYPE_TAG` must be unique per payload type within a deployment; it is
/// persisted in checkpoints, so changing it orphans suspended flows.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Explicit tag compared by value on receipt.
    const TYPE_TAG: &'static str;
}

macro_rules! builtin_payload {
    ($($ty:ty => $tag:literal),* $(,)?) => {
        $(impl Payload for $ty {
            const TYPE_TAG: &'static str = $tag;
        })*
    };
}

builtin_payload! {
    String => "String",
    i32 => "i32",
    i64 => "i64",
    u64 => "u64",
    bool => "bool",
    () => "()",
    Vec<u8> => "Vec<u8>",
}

/// The tagged JSON document carried as message bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload type tag.
    pub type_tag: String,
    /// Payload body.
    pub body: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed payload.
    pub fn wrap<T: Payload>(value: &T) -> Result<Self, FlowError> {
        let body = serde_json::to_value(value).map_err(|e| FlowError::Serialization {
            context: format!("payload of type '{}'", T::TYPE_TAG),
            details: e.to_string(),
        })?;
        Ok(Self {
            type_tag: T::TYPE_TAG.to_string(),
            body,
        })
    }

    /// Decode the body as `T`, checking the tag first.
    pub fn unwrap_as<T: Payload>(self, topic: &str) -> Result<T, FlowError> {
        if self.type_tag != T::TYPE_TAG {
            return Err(FlowError::ProtocolMismatch {
                topic: topic.to_string(),
                expected: T::TYPE_TAG.to_string(),
                actual: self.type_tag,
            });
        }
        serde_json::from_value(self.body).map_err(|e| FlowError::Serialization {
            context: format!("payload of type '{}'", T::TYPE_TAG),
            details: e.to_string(),
        })
    }

    /// Serialize to message bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FlowError> {
        serde_json::to_vec(self).map_err(|e| FlowError::Serialization {
            context: "payload envelope".to_string(),
            details: e.to_string(),
        })
    }

    /// Parse message bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FlowError> {
        serde_json::from_slice(bytes).map_err(|e| FlowError::Serialization {
            context: "payload envelope".to_string(),
            details: e.to_string(),
        })
    }
}
