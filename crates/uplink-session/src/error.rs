//! Error types for uplink-session
//!
//! Errors are grouped by the concern that raises them:
//!
//! - [`StateError`]: illegal use of the session state machine. A
//!   [`StateError::ConsistencyViolation`] always indicates a bug in the caller
//!   or in this crate, never a condition caused by the remote side.
//! - [`OutboxError`]: admission control of the bounded priority outbox.
//! - [`TransportError`]: failures reported by the injected transport.
//! - [`ConfigError`]: invalid configuration values.
//!
//! [`SessionError`] aggregates all of them for the session façade.

use std::time::Duration;

use thiserror::Error;

use crate::message::MessagePriority;

/// Result type for session façade operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by the session state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// An illegal state transition or a violated precondition
    #[error("Session state consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The namespace id was read before it was assigned
    #[error("Namespace id is not yet available")]
    NamespaceIdNotYetAvailable,
}

impl StateError {
    /// Create a consistency violation error
    pub fn consistency(message: impl Into<String>) -> Self {
        StateError::ConsistencyViolation(message.into())
    }
}

/// Errors raised by the bounded priority outbox
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// No capacity was configured for a priority level
    #[error("No outbox capacity configured for priority {0}")]
    MissingCapacity(MessagePriority),

    /// A priority level was configured with zero capacity
    #[error("Outbox capacity for priority {0} must be greater than zero")]
    ZeroCapacity(MessagePriority),

    /// The queue for the given priority was full and the caller did not allow blocking
    #[error("Outbox queue for priority {priority} is full ({depth} queued, oldest waiting {head_age:?})")]
    CapacityExceeded {
        /// Priority level of the rejected item
        priority: MessagePriority,
        /// Number of items queued at the time of rejection
        depth: usize,
        /// Time the head element has spent in the queue
        head_age: Option<Duration>,
    },

    /// The outbox was closed; no further items are accepted
    #[error("Outbox is closed")]
    Closed,
}

/// Errors reported by the transport collaborator
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O failure on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was already closed
    #[error("Transport closed")]
    Closed,

    /// Any other transport-specific failure
    #[error("Transport error: {0}")]
    Other(String),
}

/// Errors caused by invalid configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Aggregated error type of the session façade
#[derive(Error, Debug)]
pub enum SessionError {
    /// State machine misuse
    #[error(transparent)]
    State(#[from] StateError),

    /// Outbox admission failure
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The session was built outside a tokio runtime
    #[error("No tokio runtime to run the session queues on: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl SessionError {
    /// Whether this error indicates a programming error rather than a runtime condition
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, SessionError::State(StateError::ConsistencyViolation(_)))
    }
}
