//! Collaborator traits
//!
//! A session does not own any socket or stream. The embedding application
//! provides:
//!
//! - an [`UplinkTransport`] that writes message blocks and closes the connection,
//! - a [`SessionEventHandler`] that observes lifecycle changes,
//! - a [`MessageBlockHandler`] that consumes incoming message blocks.
//!
//! [`UplinkTransport::terminate_session`] and every [`SessionEventHandler`]
//! method are invoked while the session state lock is held. They must return
//! promptly and must not call back into the session.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::{ChannelId, MessageBlock};
use crate::state::{FatalErrorKind, SessionState};

/// Low-level protocol wrapper around the connection's byte streams
#[async_trait]
pub trait UplinkTransport: Send + Sync + 'static {
    /// Write one message block to the given channel
    async fn send_message_block(
        &self,
        channel_id: ChannelId,
        block: MessageBlock,
    ) -> Result<(), TransportError>;

    /// Try to write a regular goodbye message; `false` if it could not be sent
    async fn attempt_to_send_regular_goodbye_message(&self) -> bool;

    /// Close the connection immediately
    ///
    /// Must be idempotent and must not block.
    fn terminate_session(&self);
}

/// Observer of session lifecycle changes
pub trait SessionEventHandler: Send + Sync + 'static {
    /// Called on every real transition; never for the initial state
    fn on_session_state_changed(&self, _old_state: SessionState, _new_state: SessionState) {}

    /// Called exactly once, when the first terminal state is entered
    fn on_terminal_state_reached(
        &self,
        _state: SessionState,
        _fatal_error: Option<FatalErrorKind>,
    ) {
    }

    /// Called when the session enters `Active`
    fn on_session_activating(&self, _namespace_id: Option<&str>) {}

    /// Called when the session leaves `Active`
    fn on_active_session_terminating(&self) {}
}

/// Event handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionEventHandler;

impl SessionEventHandler for NoopSessionEventHandler {}

/// Consumer of incoming message blocks
///
/// Invoked from the session's incoming queue, one block at a time and in
/// reception order. An error is logged and does not stop later blocks.
#[async_trait]
pub trait MessageBlockHandler: Send + Sync + 'static {
    async fn handle_message_block(
        &self,
        channel_id: ChannelId,
        block: MessageBlock,
    ) -> anyhow::Result<()>;
}

/// Message block handler that drops every block
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingMessageBlockHandler;

#[async_trait]
impl MessageBlockHandler for DiscardingMessageBlockHandler {
    async fn handle_message_block(
        &self,
        _channel_id: ChannelId,
        _block: MessageBlock,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
