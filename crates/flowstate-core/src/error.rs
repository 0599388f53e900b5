// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowstate-core.
//!
//! [`FlowError`] is what a flow's result handle fails with. [`StoreError`] is
//! raised by checkpoint store adapters and [`StartupError`] aborts node boot.

use std::fmt;

/// Result type using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors that terminate a flow.
///
/// Cloneable so that every observer of a result handle sees the same failure.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlowError {
    /// The flow's own logic returned an error.
    Logic {
        /// Root cause as reported by the flow.
        message: String,
    },

    /// A message arrived whose payload tag differs from the one the flow awaits.
    ProtocolMismatch {
        /// The topic the flow was waiting on.
        topic: String,
        /// The type tag recorded in the checkpoint.
        expected: String,
        /// The type tag carried by the incoming payload.
        actual: String,
    },

    /// Flow state or a payload could not be (de)serialized.
    Serialization {
        /// What was being (de)serialized.
        context: String,
        /// Error details.
        details: String,
    },

    /// A send was requested without a destination.
    MissingDestination {
        /// The topic of the outgoing message.
        topic: String,
    },

    /// The checkpoint store rejected a write or delete.
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The manager was shut down before the flow could be scheduled.
    ShutDown,

    /// The affinity executor no longer accepts jobs.
    ExecutorClosed,
}

impl FlowError {
    /// Convenience constructor for logic failures.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Logic { .. } => "FLOW_LOGIC_FAILED",
            Self::ProtocolMismatch { .. } => "PROTOCOL_MISMATCH",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::MissingDestination { .. } => "MISSING_DESTINATION",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::ShutDown => "SHUT_DOWN",
            Self::ExecutorClosed => "EXECUTOR_CLOSED",
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logic { message } => write!(f, "Flow logic failed: {}", message),
            Self::ProtocolMismatch {
                topic,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Protocol mismatch on topic '{}': expected payload of type '{}', got '{}'",
                    topic, expected, actual
                )
            }
            Self::Serialization { context, details } => {
                write!(f, "Failed to serialize {}: {}", context, details)
            }
            Self::MissingDestination { topic } => {
                write!(f, "No destination given for message on topic '{}'", topic)
            }
            Self::Storage { operation, details } => {
                write!(f, "Checkpoint storage error during '{}': {}", operation, details)
            }
            Self::ShutDown => write!(f, "State machine manager is shut down"),
            Self::ExecutorClosed => write!(f, "Affinity executor is closed"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        FlowError::Storage {
            operation: err.operation().to_string(),
            details: err.to_string(),
        }
    }
}

/// Checkpoint store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database rejected the operation.
    #[error("database error during '{operation}': {source}")]
    Database {
        /// The operation that failed.
        operation: &'static str,
        /// The driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The store could not be opened.
    #[error("failed to open checkpoint store: {0}")]
    Open(String),
}

impl StoreError {
    /// The operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Database { operation, .. } => operation,
            Self::Open(_) => "open",
        }
    }

    pub(crate) fn db(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| StoreError::Database { operation, source }
    }
}

/// Fatal errors raised while booting the state machine manager.
///
/// None of these are recoverable locally; node startup must abort.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Stored checkpoints could not be enumerated.
    #[error("checkpoint storage unreadable: {0}")]
    Storage(#[from] StoreError),

    /// A stored checkpoint could not be decoded.
    #[error("checkpoint {key} is corrupt: {details}")]
    CorruptCheckpoint {
        /// Hex key of the checkpoint.
        key: String,
        /// Decoder error.
        details: String,
    },

    /// A checkpoint names a flow type that was never registered.
    #[error("checkpoint {key} refers to unknown flow '{flow_name}'")]
    UnknownFlow {
        /// Hex key of the checkpoint.
        key: String,
        /// The flow name found in the checkpoint.
        flow_name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_error_codes() {
        let test_cases = vec![
            (FlowError::logic("boom"), "FLOW_LOGIC_FAILED"),
            (
                FlowError::ProtocolMismatch {
                    topic: "swap.2".to_string(),
                    expected: "i32".to_string(),
                    actual: "String".to_string(),
                },
                "PROTOCOL_MISMATCH",
            ),
            (
                FlowError::Serialization {
                    context: "flow state".to_string(),
                    details: "eof".to_string(),
                },
                "SERIALIZATION_ERROR",
            ),
            (
                FlowError::MissingDestination {
                    topic: "ping.1".to_string(),
                },
                "MISSING_DESTINATION",
            ),
            (
                FlowError::Storage {
                    operation: "put".to_string(),
                    details: "disk full".to_string(),
                },
                "STORAGE_ERROR",
            ),
            (FlowError::ShutDown, "SHUT_DOWN"),
            (FlowError::ExecutorClosed, "EXECUTOR_CLOSED"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_protocol_mismatch_names_both_types_and_topic() {
        let err = FlowError::ProtocolMismatch {
            topic: "swap.2".to_string(),
            expected: "i32".to_string(),
            actual: "String".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Protocol mismatch on topic 'swap.2': expected payload of type 'i32', got 'String'"
        );
    }

    #[test]
    fn test_flow_error_display() {
        assert_eq!(
            FlowError::logic("counterparty refused").to_string(),
            "Flow logic failed: counterparty refused"
        );
        assert_eq!(
            FlowError::MissingDestination {
                topic: "ping.1".to_string()
            }
            .to_string(),
            "No destination given for message on topic 'ping.1'"
        );
        assert_eq!(
            FlowError::ShutDown.to_string(),
            "State machine manager is shut down"
        );
    }

    #[test]
    fn test_store_error_converts_to_storage_failure() {
        let err: FlowError = StoreError::Open("locked".to_string()).into();
        match err {
            FlowError::Storage { operation, details } => {
                assert_eq!(operation, "open");
                assert!(details.contains("locked"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
