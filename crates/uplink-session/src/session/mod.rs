//! Uplink session façade
//!
//! [`UplinkSession`] combines the state machine, the bounded priority outbox
//! and the two ordered queues into one cheaply cloneable handle. It translates
//! transport events into state machine calls and acts on the follow-ups those
//! calls return.
//!
//! # Shutdown
//!
//! - **Clean**: [`UplinkSession::initiate_clean_shutdown_if_running`] discards
//!   queued payload, sends a goodbye and waits (bounded by the goodbye
//!   confirmation timeout) for the remote goodbye before closing.
//! - **Unclean**: [`UplinkSession::initiate_unclean_shutdown_if_still_running`]
//!   discards queued payload and closes the connection without a goodbye.
//!
//! Both are idempotent. Any write failure, outbox overflow, fatal error or
//! premature end of the incoming stream leads to an unclean shutdown.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uplink_session::prelude::*;
//!
//! # async fn example(transport: Arc<dyn UplinkTransport>) -> uplink_session::Result<()> {
//! let session = UplinkSessionBuilder::new(SessionRole::Client, transport)
//!     .with_config(UplinkSessionConfig::default())
//!     .build()?;
//!
//! session.state_machine().mark_client_handshake_sent_or_received()?;
//! session.state_machine().mark_server_handshake_sent_or_received()?;
//! session.state_machine().mark_handshake_successful()?;
//!
//! session
//!     .enqueue_message_block_for_sending(1, MessageBlock::new(7, &b"hello"[..]), MessagePriority::Normal, true)
//!     .await?;
//!
//! session.initiate_clean_shutdown_if_running();
//! let final_state = session.wait_for_terminal_state().await;
//! # let _ = final_state;
//! # Ok(())
//! # }
//! ```

mod incoming;
mod timers;

pub use incoming::IncomingEvent;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::config::UplinkSessionConfig;
use crate::error::{OutboxError, Result};
use crate::message::{ChannelId, MessageBlock, MessageBlockWithMetadata, MessagePriority};
use crate::outbox::BoundedPriorityOutbox;
use crate::queue::OrderedTaskQueue;
use crate::state::{
    FatalErrorKind, Followup, GoodbyeOutcome, SessionRole, SessionState, SessionStateMachine,
    StateMachineTimeouts,
};
use crate::transport::{
    DiscardingMessageBlockHandler, MessageBlockHandler, NoopSessionEventHandler,
    SessionEventHandler, UplinkTransport,
};

static NEXT_CLIENT_SESSION_NUMBER: AtomicU64 = AtomicU64::new(1);
static NEXT_SERVER_SESSION_NUMBER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique local session id such as `c1` or `s4`
pub fn next_local_session_id(role: SessionRole) -> String {
    let counter = match role {
        SessionRole::Client => &NEXT_CLIENT_SESSION_NUMBER,
        SessionRole::Server => &NEXT_SERVER_SESSION_NUMBER,
    };
    format!("{}{}", role.id_prefix(), counter.fetch_add(1, Ordering::Relaxed))
}

/// Builder for [`UplinkSession`]
pub struct UplinkSessionBuilder {
    role: SessionRole,
    transport: Arc<dyn UplinkTransport>,
    config: UplinkSessionConfig,
    local_session_id: Option<String>,
    event_handler: Arc<dyn SessionEventHandler>,
    message_handler: Arc<dyn MessageBlockHandler>,
}

impl UplinkSessionBuilder {
    pub fn new(role: SessionRole, transport: Arc<dyn UplinkTransport>) -> Self {
        Self {
            role,
            transport,
            config: UplinkSessionConfig::default(),
            local_session_id: None,
            event_handler: Arc::new(NoopSessionEventHandler),
            message_handler: Arc::new(DiscardingMessageBlockHandler),
        }
    }

    pub fn with_config(mut self, config: UplinkSessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a fixed local session id instead of a generated one
    pub fn with_local_session_id(mut self, local_session_id: impl Into<String>) -> Self {
        self.local_session_id = Some(local_session_id.into());
        self
    }

    pub fn with_event_handler(mut self, event_handler: Arc<dyn SessionEventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    pub fn with_message_handler(mut self, message_handler: Arc<dyn MessageBlockHandler>) -> Self {
        self.message_handler = message_handler;
        self
    }

    /// Validate the configuration and create the session
    ///
    /// The ordered queue workers are spawned on the current tokio runtime;
    /// building outside of one fails with [`SessionError::NoRuntime`].
    ///
    /// [`SessionError::NoRuntime`]: crate::error::SessionError::NoRuntime
    pub fn build(self) -> Result<UplinkSession> {
        self.config.validate()?;
        let runtime = Handle::try_current()?;
        let local_session_id = self
            .local_session_id
            .unwrap_or_else(|| next_local_session_id(self.role));

        let outbox = BoundedPriorityOutbox::new(local_session_id.clone(), &self.config.outbox_capacities)?;
        let timeouts = StateMachineTimeouts {
            handshake_response: self.config.handshake_response_timeout(),
            heartbeat_response: self.config.heartbeat_response_timeout(),
        };
        let state = SessionStateMachine::new(
            local_session_id.clone(),
            timeouts,
            self.transport.clone(),
            self.event_handler,
        );

        debug!("[{}] Created {:?} uplink session", local_session_id, self.role);

        Ok(UplinkSession {
            inner: Arc::new(SessionInner {
                role: self.role,
                incoming: OrderedTaskQueue::new(format!("{}/incoming", local_session_id), &runtime),
                outgoing: OrderedTaskQueue::new(format!("{}/outgoing", local_session_id), &runtime),
                config: self.config,
                state,
                outbox,
                transport: self.transport,
                message_handler: self.message_handler,
            }),
        })
    }
}

struct SessionInner {
    role: SessionRole,
    config: UplinkSessionConfig,
    state: SessionStateMachine,
    outbox: BoundedPriorityOutbox,
    incoming: OrderedTaskQueue,
    outgoing: OrderedTaskQueue,
    transport: Arc<dyn UplinkTransport>,
    message_handler: Arc<dyn MessageBlockHandler>,
}

/// Handle to one uplink session
#[derive(Clone)]
pub struct UplinkSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for UplinkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UplinkSession")
            .field("role", &self.inner.role)
            .field("state", &self.inner.state)
            .field("queued", &self.inner.outbox.total_len())
            .finish()
    }
}

impl UplinkSession {
    pub fn role(&self) -> SessionRole {
        self.inner.role
    }

    pub fn local_session_id(&self) -> &str {
        self.inner.state.local_session_id()
    }

    pub fn log_descriptor(&self) -> String {
        self.inner.state.log_descriptor()
    }

    pub fn config(&self) -> &UplinkSessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.state()
    }

    /// The underlying state machine, for handshake and metadata updates
    pub fn state_machine(&self) -> &SessionStateMachine {
        &self.inner.state
    }

    pub fn outbox(&self) -> &BoundedPriorityOutbox {
        &self.inner.outbox
    }

    pub fn is_shutting_down_or_shut_down(&self) -> bool {
        self.inner.state.is_shutting_down_or_shut_down()
    }

    /// Wait until the session reaches a terminal state and return it
    pub async fn wait_for_terminal_state(&self) -> SessionState {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return self.inner.state.state();
            }
        }
    }

    // ---- outgoing ----

    /// Queue a message block and schedule its transmission
    ///
    /// With `allow_blocking`, waits while the priority level is full;
    /// otherwise a full level fails the call and starts an unclean shutdown.
    /// Once the session is shutting down, anything but a goodbye message is
    /// silently discarded.
    pub async fn enqueue_message_block_for_sending(
        &self,
        channel_id: ChannelId,
        block: MessageBlock,
        priority: MessagePriority,
        allow_blocking: bool,
    ) -> Result<()> {
        if !block.is_goodbye() && self.inner.state.is_shutting_down_or_shut_down() {
            debug!(
                "[{}] Discarding outgoing message block of type {} ({} bytes) as the session is shutting down",
                self.log_descriptor(),
                block.message_type(),
                block.data_len()
            );
            return Ok(());
        }

        if self.inner.config.verbose_logging {
            trace!(
                "[{}] Enqueueing message block of type {} ({} bytes) for channel {} at priority {}",
                self.log_descriptor(),
                block.message_type(),
                block.data_len(),
                channel_id,
                priority
            );
        }

        let item = MessageBlockWithMetadata::new(channel_id, block, priority);
        let submitted = if allow_blocking {
            self.inner.outbox.submit_or_block(item).await
        } else {
            self.inner.outbox.submit_or_fail(item)
        };

        match submitted {
            Ok(()) => {}
            Err(e @ OutboxError::CapacityExceeded { .. }) => {
                warn!("[{}] {}; initiating unclean shutdown", self.log_descriptor(), e);
                self.initiate_unclean_shutdown_if_still_running()?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        let session = self.clone();
        self.inner
            .outgoing
            .enqueue(async move { session.send_next_queued_block().await });
        Ok(())
    }

    async fn send_next_queued_block(&self) -> anyhow::Result<()> {
        let Some(item) = self.inner.outbox.take_next() else {
            // drained by a shutdown since this task was scheduled
            return Ok(());
        };
        if !item.block.is_goodbye() && self.inner.state.is_shutting_down_or_shut_down() {
            debug!(
                "[{}] Discarding message block of type {} queued before shutdown",
                self.log_descriptor(),
                item.block.message_type()
            );
            return Ok(());
        }
        if self.inner.config.verbose_logging {
            trace!(
                "[{}] Sending message block of type {} ({} bytes) on channel {}; queued for {} msec",
                self.log_descriptor(),
                item.block.message_type(),
                item.block.data_len(),
                item.channel_id,
                item.age().as_millis()
            );
        }
        if let Err(e) = self
            .inner
            .transport
            .send_message_block(item.channel_id, item.block)
            .await
        {
            self.handle_stream_write_error(&e.to_string())?;
        }
        Ok(())
    }

    // ---- shutdown ----

    /// Start the goodbye handshake unless a shutdown is already underway
    pub fn initiate_clean_shutdown_if_running(&self) {
        if !self.inner.state.set_shutting_down() {
            debug!(
                "[{}] Not initiating clean shutdown; the session is already shutting down",
                self.log_descriptor()
            );
            return;
        }
        let discarded = self.inner.outbox.drain();
        info!(
            "[{}] Initiating clean shutdown in state {} ({} queued message blocks discarded)",
            self.log_descriptor(),
            self.state(),
            discarded
        );

        let session = self.clone();
        self.inner
            .outgoing
            .enqueue(async move { session.send_goodbye_and_await_confirmation().await });
    }

    async fn send_goodbye_and_await_confirmation(&self) -> anyhow::Result<()> {
        if !self
            .inner
            .transport
            .attempt_to_send_regular_goodbye_message()
            .await
        {
            self.handle_stream_write_error("failed to send goodbye message")?;
            return Ok(());
        }

        match self.inner.state.mark_own_goodbye_sent()? {
            GoodbyeOutcome::HandshakeCompleted => {
                debug!(
                    "[{}] Goodbye sent in response to the remote goodbye; closing",
                    self.log_descriptor()
                );
                self.close_outgoing_stream()?;
            }
            GoodbyeOutcome::HandshakeStarted => {
                debug!(
                    "[{}] Goodbye sent; waiting up to {} msec for the remote goodbye",
                    self.log_descriptor(),
                    self.inner.config.goodbye_confirmation_timeout_ms
                );
                self.arm_goodbye_confirmation_timer();
            }
            GoodbyeOutcome::Duplicate | GoodbyeOutcome::Ignored => {
                debug!(
                    "[{}] Goodbye sent in state {}; closing",
                    self.log_descriptor(),
                    self.state()
                );
                self.close_outgoing_stream()?;
            }
        }
        Ok(())
    }

    /// Close the connection without a goodbye handshake
    ///
    /// No-op once the session has reached a terminal state or an unclean
    /// shutdown is already in progress.
    pub fn initiate_unclean_shutdown_if_still_running(&self) -> Result<()> {
        if self.inner.state.is_in_terminal_state() {
            return Ok(());
        }
        if !self.inner.state.mark_unclean_shutdown_initiated()? {
            return Ok(());
        }
        // close first so waiting producers fail instead of taking the freed slots
        self.inner.outbox.close();
        let discarded = self.inner.outbox.drain();
        info!(
            "[{}] Initiated unclean shutdown ({} queued message blocks discarded)",
            self.log_descriptor(),
            discarded
        );
        self.close_outgoing_stream()
    }

    /// Close the transport and settle the final state
    fn close_outgoing_stream(&self) -> Result<()> {
        self.inner.transport.terminate_session();
        self.inner.outbox.close();
        self.inner.state.mark_outgoing_stream_closed()?;
        Ok(())
    }

    // ---- transport events ----

    /// React to a regular goodbye message from the remote side
    pub fn handle_regular_remote_goodbye_message(&self) -> Result<()> {
        match self.inner.state.mark_remote_side_has_sent_goodbye()? {
            GoodbyeOutcome::Duplicate => {
                warn!(
                    "[{}] Protocol violation: received more than one goodbye message; ignoring",
                    self.log_descriptor()
                );
            }
            GoodbyeOutcome::HandshakeStarted => {
                debug!(
                    "[{}] Received goodbye from the remote side; starting local shutdown",
                    self.log_descriptor()
                );
                self.initiate_clean_shutdown_if_running();
            }
            GoodbyeOutcome::HandshakeCompleted => {
                debug!(
                    "[{}] Remote side confirmed the goodbye; closing",
                    self.log_descriptor()
                );
                self.close_outgoing_stream()?;
            }
            GoodbyeOutcome::Ignored => {}
        }
        Ok(())
    }

    /// React to an error goodbye (`E<code>: <text>`) from the remote side
    pub fn handle_remote_error_goodbye_message(&self, wrapped_message: &str) -> Result<()> {
        let (kind, message) = FatalErrorKind::parse_wrapped_message(wrapped_message);
        warn!(
            "[{}] Remote side closed the session with error {}: {}",
            self.log_descriptor(),
            kind,
            message
        );
        self.inner.state.mark_fatal_error(kind);
        self.initiate_unclean_shutdown_if_still_running()
    }

    pub fn handle_incoming_stream_closed_or_eof(&self) -> Result<()> {
        match self.inner.state.mark_incoming_stream_closed_or_eof()? {
            Followup::None => Ok(()),
            Followup::InitiateUncleanShutdown => {
                self.initiate_unclean_shutdown_if_still_running()
            }
        }
    }

    /// Record a fatal error and shut down without a goodbye
    pub fn handle_fatal_error(&self, kind: FatalErrorKind, message: &str) -> Result<()> {
        warn!(
            "[{}] Fatal session error {}: {}",
            self.log_descriptor(),
            kind,
            message
        );
        self.inner.state.mark_fatal_error(kind);
        self.initiate_unclean_shutdown_if_still_running()
    }

    pub fn handle_stream_write_error(&self, error: &str) -> Result<()> {
        self.inner.state.mark_outgoing_stream_write_error(error);
        if !self.inner.state.is_shutting_down_or_shut_down() {
            self.inner
                .state
                .mark_fatal_error(FatalErrorKind::LowLevelConnectionError);
        }
        self.initiate_unclean_shutdown_if_still_running()
    }

    pub fn handle_stream_read_error(&self, error: &str) -> Result<()> {
        if self.inner.state.is_shutting_down_or_shut_down() {
            debug!(
                "[{}] Read error while shutting down: {}",
                self.log_descriptor(),
                error
            );
        } else {
            warn!(
                "[{}] Error reading from the incoming stream: {}",
                self.log_descriptor(),
                error
            );
            self.inner
                .state
                .mark_fatal_error(FatalErrorKind::LowLevelConnectionError);
        }
        self.initiate_unclean_shutdown_if_still_running()
    }

    /// Terminate a session whose handshake failed
    pub fn handle_handshake_failure(&self, kind: FatalErrorKind, message: &str) -> Result<()> {
        warn!(
            "[{}] Handshake failed with {}: {}",
            self.log_descriptor(),
            kind,
            message
        );
        self.inner.state.mark_fatal_error(kind);
        self.inner.outbox.close();
        self.inner.outbox.drain();
        self.inner.state.mark_handshake_failed()?;
        Ok(())
    }

    fn downgrade(&self) -> std::sync::Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }
}
