//! Session management for uplink connections
//!
//! This crate manages the lifecycle of one logical uplink session between a
//! client and a relay server: the handshake and goodbye-handshake state
//! machine, prioritized and bounded scheduling of outbound message blocks,
//! ordered processing of incoming events, heartbeat supervision and the
//! clean/unclean shutdown paths.
//!
//! Byte streams are not handled here. The embedding application supplies an
//! [`UplinkTransport`] for writing and closing, feeds received data in as
//! [`IncomingEvent`]s, and observes the session through a
//! [`SessionEventHandler`].

// Re-export modules
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod outbox;
pub mod queue;
pub mod session;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use config::UplinkSessionConfig;
pub use error::{ConfigError, OutboxError, Result, SessionError, StateError, TransportError};
pub use message::{ChannelId, MessageBlock, MessageBlockWithMetadata, MessagePriority, DEFAULT_CHANNEL_ID};
pub use outbox::BoundedPriorityOutbox;
pub use queue::OrderedTaskQueue;
pub use session::{next_local_session_id, IncomingEvent, UplinkSession, UplinkSessionBuilder};
pub use state::{
    FatalErrorKind, Followup, GoodbyeOutcome, HandshakeInfo, SessionRole, SessionSnapshot,
    SessionState, SessionStateMachine,
};
pub use transport::{MessageBlockHandler, SessionEventHandler, UplinkTransport};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ChannelId, FatalErrorKind, IncomingEvent, MessageBlock, MessageBlockHandler,
        MessagePriority, Result, SessionError, SessionEventHandler, SessionRole, SessionState,
        TransportError, UplinkSession, UplinkSessionBuilder, UplinkSessionConfig, UplinkTransport,
    };
}
