//! The authoritative session state machine
//!
//! All session state lives in one [`SessionStateRecord`] behind a single
//! mutex. Every public operation is one short critical section; transitions
//! are validated against the lifecycle graph of [`SessionState`] and the
//! goodbye preconditions before they are applied.
//!
//! Side effects of a transition run while the lock is held, in this order:
//!
//! 1. [`SessionEventHandler::on_session_state_changed`] (plus the
//!    activation/termination hooks when `Active` is entered or left)
//! 2. for terminal states only: [`UplinkTransport::terminate_session`], then
//!    [`SessionEventHandler::on_terminal_state_reached`], exactly once
//!
//! Hooks must not call back into the session.
//!
//! Operations that require an unclean shutdown do not start it themselves;
//! they return [`Followup::InitiateUncleanShutdown`] so the caller can act on
//! it after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::types::{FatalErrorKind, SessionState};
use crate::error::StateError;
use crate::transport::{SessionEventHandler, UplinkTransport};

/// Session qualifier used when the client does not provide one
pub const DEFAULT_SESSION_QUALIFIER: &str = "default";

/// Action the caller must take after a state machine operation
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// Nothing further to do
    None,
    /// The session must be torn down without a goodbye handshake
    InitiateUncleanShutdown,
}

/// Result of registering a goodbye message (own or remote)
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodbyeOutcome {
    /// First goodbye of the session; the handshake is now in progress
    HandshakeStarted,
    /// Both goodbyes are known; the connection may be closed cleanly
    HandshakeCompleted,
    /// This side's goodbye had already been registered
    Duplicate,
    /// The session was not in a state where a goodbye changes anything
    Ignored,
}

/// Snapshot of the session's metadata and flags, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub fatal_error: Option<FatalErrorKind>,
    pub namespace_id: Option<String>,
    pub incoming_closed: bool,
    pub outgoing_closed: bool,
    pub shutting_down: bool,
    pub remote_sent_goodbye: bool,
    pub own_goodbye_sent: bool,
    pub handshake_failed: bool,
    pub namespace_released: bool,
    pub protocol_version: Option<String>,
    pub client_version_info: Option<String>,
    pub account_name: Option<String>,
    pub session_qualifier: String,
    pub awaiting_heartbeat_response: bool,
}

/// Handshake-provided identity of the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol_version: Option<String>,
    pub client_version_info: Option<String>,
    pub account_name: Option<String>,
    pub session_qualifier: Option<String>,
}

/// The single mutable unit of session state
#[derive(Debug)]
struct SessionStateRecord {
    state: SessionState,
    fatal_error: Option<FatalErrorKind>,
    /// Write-once
    namespace_id: Option<String>,
    incoming_closed: bool,
    outgoing_closed: bool,
    shutting_down: bool,
    remote_sent_goodbye: bool,
    own_goodbye_sent: bool,
    handshake_failed: bool,
    namespace_released: bool,
    protocol_version: Option<String>,
    client_version_info: Option<String>,
    account_name: Option<String>,
    session_qualifier: String,
    heartbeat_last_sent: Option<Instant>,
    heartbeat_awaiting_response: bool,
    log_descriptor: String,
}

impl SessionStateRecord {
    fn new(local_session_id: &str) -> Self {
        Self {
            state: SessionState::Initial,
            fatal_error: None,
            namespace_id: None,
            incoming_closed: false,
            outgoing_closed: false,
            shutting_down: false,
            remote_sent_goodbye: false,
            own_goodbye_sent: false,
            handshake_failed: false,
            namespace_released: false,
            protocol_version: None,
            client_version_info: None,
            account_name: None,
            session_qualifier: DEFAULT_SESSION_QUALIFIER.to_string(),
            heartbeat_last_sent: None,
            heartbeat_awaiting_response: false,
            log_descriptor: local_session_id.to_string(),
        }
    }
}

/// Timeouts the state machine evaluates itself
#[derive(Debug, Clone, Copy)]
pub struct StateMachineTimeouts {
    /// Heartbeat round trips above this are logged as slow
    pub handshake_response: Duration,
    /// A heartbeat unanswered for longer than this is fatal
    pub heartbeat_response: Duration,
}

/// Mutex-guarded session state with validated transitions
pub struct SessionStateMachine {
    local_session_id: String,
    record: Mutex<SessionStateRecord>,
    timeouts: StateMachineTimeouts,
    transport: Arc<dyn UplinkTransport>,
    event_handler: Arc<dyn SessionEventHandler>,
    state_tx: watch::Sender<SessionState>,
}

impl std::fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // hooks run with the record locked and may format the session
        let record = self.record.try_lock();
        let mut out = f.debug_struct("SessionStateMachine");
        out.field("local_session_id", &self.local_session_id);
        match record.as_deref() {
            Some(record) => out.field("record", record),
            None => out.field("record", &format_args!("<locked>")),
        };
        out.field("timeouts", &self.timeouts).finish()
    }
}

impl SessionStateMachine {
    /// Create a state machine in [`SessionState::Initial`]
    pub fn new(
        local_session_id: impl Into<String>,
        timeouts: StateMachineTimeouts,
        transport: Arc<dyn UplinkTransport>,
        event_handler: Arc<dyn SessionEventHandler>,
    ) -> Self {
        let local_session_id = local_session_id.into();
        let (state_tx, _) = watch::channel(SessionState::Initial);
        Self {
            record: Mutex::new(SessionStateRecord::new(&local_session_id)),
            local_session_id,
            timeouts,
            transport,
            event_handler,
            state_tx,
        }
    }

    pub fn local_session_id(&self) -> &str {
        &self.local_session_id
    }

    /// Current log prefix: local session id, plus the namespace id once assigned
    pub fn log_descriptor(&self) -> String {
        self.record.lock().log_descriptor.clone()
    }

    pub fn state(&self) -> SessionState {
        self.record.lock().state
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let r = self.record.lock();
        SessionSnapshot {
            state: r.state,
            fatal_error: r.fatal_error,
            namespace_id: r.namespace_id.clone(),
            incoming_closed: r.incoming_closed,
            outgoing_closed: r.outgoing_closed,
            shutting_down: r.shutting_down,
            remote_sent_goodbye: r.remote_sent_goodbye,
            own_goodbye_sent: r.own_goodbye_sent,
            handshake_failed: r.handshake_failed,
            namespace_released: r.namespace_released,
            protocol_version: r.protocol_version.clone(),
            client_version_info: r.client_version_info.clone(),
            account_name: r.account_name.clone(),
            session_qualifier: r.session_qualifier.clone(),
            awaiting_heartbeat_response: r.heartbeat_awaiting_response,
        }
    }

    // ---- handshake ----

    pub fn mark_client_handshake_sent_or_received(&self) -> Result<(), StateError> {
        let mut r = self.record.lock();
        if r.state != SessionState::Initial {
            warn!(
                "[{}] Ignoring client handshake event in state {}",
                r.log_descriptor, r.state
            );
            return Ok(());
        }
        self.transition(&mut r, SessionState::ClientHandshakeReady)
    }

    pub fn mark_server_handshake_sent_or_received(&self) -> Result<(), StateError> {
        let mut r = self.record.lock();
        if r.state != SessionState::ClientHandshakeReady {
            warn!(
                "[{}] Ignoring server handshake event in state {}",
                r.log_descriptor, r.state
            );
            return Ok(());
        }
        self.transition(&mut r, SessionState::ServerHandshakeReady)
    }

    pub fn mark_handshake_successful(&self) -> Result<(), StateError> {
        let mut r = self.record.lock();
        if r.state == SessionState::UncleanShutdownInitiated {
            // the handshake raced with a shutdown request; the shutdown wins
            warn!(
                "[{}] Handshake completed while an unclean shutdown is in progress; not activating",
                r.log_descriptor
            );
            return Ok(());
        }
        self.transition(&mut r, SessionState::Active)
    }

    /// Mark the handshake as failed; repeated calls have no effect
    pub fn mark_handshake_failed(&self) -> Result<(), StateError> {
        let mut r = self.record.lock();
        if r.handshake_failed {
            return Ok(());
        }
        r.handshake_failed = true;
        r.shutting_down = true;
        if r.state.is_terminal() {
            debug!(
                "[{}] Handshake failure reported in terminal state {}",
                r.log_descriptor, r.state
            );
            return Ok(());
        }
        self.transition(&mut r, SessionState::SessionRefusedOrHandshakeError)
    }

    /// Record client-provided handshake data
    pub fn set_handshake_info(&self, info: HandshakeInfo) {
        let mut r = self.record.lock();
        r.protocol_version = info.protocol_version;
        r.client_version_info = info.client_version_info;
        r.account_name = info.account_name;
        if let Some(qualifier) = info.session_qualifier.filter(|q| !q.is_empty()) {
            r.session_qualifier = qualifier;
        }
    }

    // ---- namespace ----

    /// Assign the server-provided namespace id; it can be set only once
    pub fn set_assigned_namespace_id(&self, namespace_id: impl Into<String>) -> Result<(), StateError> {
        let namespace_id = namespace_id.into();
        let mut r = self.record.lock();
        if let Some(existing) = &r.namespace_id {
            let message = format!(
                "Namespace id already assigned ('{}'), refusing to replace it with '{}'",
                existing, namespace_id
            );
            return Err(self.violation(&r, message));
        }
        r.log_descriptor = format!("{}/{}", self.local_session_id, namespace_id);
        debug!("[{}] Assigned namespace id", r.log_descriptor);
        r.namespace_id = Some(namespace_id);
        Ok(())
    }

    pub fn assigned_namespace_id(&self) -> Result<String, StateError> {
        self.record
            .lock()
            .namespace_id
            .clone()
            .ok_or(StateError::NamespaceIdNotYetAvailable)
    }

    /// Mark the namespace as released; returns `true` on the first call after assignment
    pub fn mark_namespace_released(&self) -> bool {
        let mut r = self.record.lock();
        if r.namespace_id.is_none() || r.namespace_released {
            return false;
        }
        r.namespace_released = true;
        true
    }

    // ---- goodbye handshake ----

    pub fn mark_remote_side_has_sent_goodbye(&self) -> Result<GoodbyeOutcome, StateError> {
        let mut r = self.record.lock();
        if r.remote_sent_goodbye {
            return Ok(GoodbyeOutcome::Duplicate);
        }
        r.remote_sent_goodbye = true;
        match r.state {
            SessionState::Active => {
                self.transition(&mut r, SessionState::GoodbyeHandshake)?;
                Ok(GoodbyeOutcome::HandshakeStarted)
            }
            SessionState::GoodbyeHandshake => {
                self.transition(&mut r, SessionState::GoodbyeHandshakeComplete)?;
                Ok(GoodbyeOutcome::HandshakeCompleted)
            }
            other => {
                debug!(
                    "[{}] Received remote goodbye in state {}; no state change",
                    r.log_descriptor, other
                );
                Ok(GoodbyeOutcome::Ignored)
            }
        }
    }

    pub fn mark_own_goodbye_sent(&self) -> Result<GoodbyeOutcome, StateError> {
        let mut r = self.record.lock();
        if r.own_goodbye_sent {
            return Ok(GoodbyeOutcome::Duplicate);
        }
        r.own_goodbye_sent = true;
        match r.state {
            SessionState::Active => {
                self.transition(&mut r, SessionState::GoodbyeHandshake)?;
                Ok(GoodbyeOutcome::HandshakeStarted)
            }
            SessionState::GoodbyeHandshake => {
                self.transition(&mut r, SessionState::GoodbyeHandshakeComplete)?;
                Ok(GoodbyeOutcome::HandshakeCompleted)
            }
            other => {
                debug!(
                    "[{}] Sent local goodbye in state {}; no state change",
                    r.log_descriptor, other
                );
                Ok(GoodbyeOutcome::Ignored)
            }
        }
    }

    // ---- stream events ----

    /// Register the end of the incoming stream; may only happen once
    pub fn mark_incoming_stream_closed_or_eof(&self) -> Result<Followup, StateError> {
        let mut r = self.record.lock();
        if r.incoming_closed {
            return Err(self.violation(&r, "Incoming stream reported closed twice".to_string()));
        }
        r.incoming_closed = true;

        if r.state == SessionState::UncleanShutdownInitiated {
            self.transition(&mut r, SessionState::UncleanShutdown)?;
            return Ok(Followup::None);
        }
        if r.state.is_terminal() {
            debug!(
                "[{}] Incoming stream closed after reaching terminal state {}",
                r.log_descriptor, r.state
            );
            return Ok(Followup::None);
        }
        if r.own_goodbye_sent && r.remote_sent_goodbye {
            self.transition(&mut r, SessionState::CleanShutdown)?;
            return Ok(Followup::None);
        }
        if r.remote_sent_goodbye && r.shutting_down {
            debug!(
                "[{}] Incoming stream closed after the remote goodbye while our goodbye reply was still in flight",
                r.log_descriptor
            );
        }
        // abrupt disconnect, or a peer that closes without a goodbye handshake
        info!(
            "[{}] Incoming stream closed in state {} without a complete goodbye handshake",
            r.log_descriptor, r.state
        );
        Ok(Followup::InitiateUncleanShutdown)
    }

    /// Record a fatal error; the first recorded kind is kept
    ///
    /// This does not change the state; the caller initiates the shutdown.
    pub fn mark_fatal_error(&self, kind: FatalErrorKind) {
        let mut r = self.record.lock();
        match r.fatal_error {
            None => r.fatal_error = Some(kind),
            Some(existing) => debug!(
                "[{}] Not recording fatal error {} as {} was already recorded",
                r.log_descriptor, kind, existing
            ),
        }
    }

    /// Diagnostic only; the caller initiates the shutdown
    pub fn mark_outgoing_stream_write_error(&self, error: &str) {
        let r = self.record.lock();
        if r.shutting_down {
            debug!(
                "[{}] Write error while shutting down: {}",
                r.log_descriptor, error
            );
        } else {
            warn!("[{}] Error writing to the outgoing stream: {}", r.log_descriptor, error);
        }
    }

    /// Register the close of the outgoing stream and settle the final state
    pub fn mark_outgoing_stream_closed(&self) -> Result<(), StateError> {
        let mut r = self.record.lock();
        if r.outgoing_closed {
            return Ok(());
        }
        r.outgoing_closed = true;
        r.shutting_down = true;

        match r.state {
            SessionState::GoodbyeHandshakeComplete => {
                self.transition(&mut r, SessionState::CleanShutdown)
            }
            SessionState::UncleanShutdownInitiated => {
                self.transition(&mut r, SessionState::UncleanShutdown)
            }
            SessionState::CleanShutdown | SessionState::UncleanShutdown => {
                debug!(
                    "[{}] Outgoing stream closed in terminal state {}",
                    r.log_descriptor, r.state
                );
                Ok(())
            }
            SessionState::SessionRefusedOrHandshakeError => Ok(()),
            SessionState::GoodbyeHandshake => {
                // tolerated: seen when the confirmation timer fires or on
                // disconnects racing the remote goodbye
                warn!(
                    "[{}] Outgoing stream closed before the goodbye handshake completed (own sent: {}, remote sent: {})",
                    r.log_descriptor, r.own_goodbye_sent, r.remote_sent_goodbye
                );
                self.transition(&mut r, SessionState::UncleanShutdown)
            }
            other => {
                warn!(
                    "[{}] Outgoing stream closed in state {} without a goodbye handshake",
                    r.log_descriptor, other
                );
                self.transition(&mut r, SessionState::UncleanShutdown)
            }
        }
    }

    /// Enter [`SessionState::UncleanShutdownInitiated`] unless already there or terminal
    ///
    /// Returns `true` if this call changed the state.
    pub fn mark_unclean_shutdown_initiated(&self) -> Result<bool, StateError> {
        let mut r = self.record.lock();
        r.shutting_down = true;
        if r.state.is_terminal() || r.state == SessionState::UncleanShutdownInitiated {
            return Ok(false);
        }
        self.transition(&mut r, SessionState::UncleanShutdownInitiated)?;
        Ok(true)
    }

    // ---- shutdown latch ----

    /// Set the shutting-down latch; returns `true` if this call set it
    pub fn set_shutting_down(&self) -> bool {
        let mut r = self.record.lock();
        let was_set = r.shutting_down;
        r.shutting_down = true;
        !was_set
    }

    pub fn is_shutting_down_or_shut_down(&self) -> bool {
        let r = self.record.lock();
        r.shutting_down || r.state.is_terminal()
    }

    pub fn is_in_terminal_state(&self) -> bool {
        self.record.lock().state.is_terminal()
    }

    // ---- heartbeat ----

    pub fn mark_heartbeat_sent(&self) {
        let mut r = self.record.lock();
        if r.heartbeat_awaiting_response {
            // keep the original timestamp so the watchdog still sees the overdue response
            warn!(
                "[{}] Sending a heartbeat while the previous one is still unanswered",
                r.log_descriptor
            );
            return;
        }
        r.heartbeat_last_sent = Some(Instant::now());
        r.heartbeat_awaiting_response = true;
    }

    /// Returns the round-trip time if a response was expected
    pub fn mark_heartbeat_response_received(&self) -> Option<Duration> {
        let mut r = self.record.lock();
        if !r.heartbeat_awaiting_response {
            debug!("[{}] Ignoring unexpected heartbeat response", r.log_descriptor);
            return None;
        }
        r.heartbeat_awaiting_response = false;
        let rtt = r.heartbeat_last_sent.map(|sent| sent.elapsed())?;
        if rtt > self.timeouts.handshake_response {
            warn!(
                "[{}] Slow heartbeat response: round trip took {} msec",
                r.log_descriptor,
                rtt.as_millis()
            );
        }
        Some(rtt)
    }

    pub fn validate_heartbeat_response_if_expected(&self) -> Followup {
        let r = self.record.lock();
        if !r.heartbeat_awaiting_response || r.state.is_terminal() || r.incoming_closed {
            return Followup::None;
        }
        let overdue = r
            .heartbeat_last_sent
            .map(|sent| sent.elapsed() > self.timeouts.heartbeat_response)
            .unwrap_or(false);
        if !overdue {
            return Followup::None;
        }
        if r.shutting_down {
            debug!(
                "[{}] Heartbeat response overdue during shutdown",
                r.log_descriptor
            );
            return Followup::None;
        }
        warn!(
            "[{}] No heartbeat response within {} msec; considering the connection lost",
            r.log_descriptor,
            self.timeouts.heartbeat_response.as_millis()
        );
        Followup::InitiateUncleanShutdown
    }

    // ---- internals ----

    fn violation(&self, r: &SessionStateRecord, message: String) -> StateError {
        error!(
            "[{}] Consistency violation in state {}: {}",
            r.log_descriptor, r.state, message
        );
        StateError::ConsistencyViolation(message)
    }

    fn transition(
        &self,
        r: &mut SessionStateRecord,
        new_state: SessionState,
    ) -> Result<(), StateError> {
        let old_state = r.state;
        if old_state == new_state {
            if matches!(
                new_state,
                SessionState::CleanShutdown | SessionState::UncleanShutdown
            ) {
                debug!(
                    "[{}] Ignoring redundant request to enter {}",
                    r.log_descriptor, new_state
                );
                return Ok(());
            }
            let message = format!("Attempted to re-enter state {}", new_state);
            return Err(self.violation(r, message));
        }
        if old_state.is_terminal() {
            let message = format!(
                "Attempted transition {} -> {} from a terminal state",
                old_state, new_state
            );
            return Err(self.violation(r, message));
        }
        if !old_state.can_transition_to(new_state) {
            let message = format!("Invalid transition {} -> {}", old_state, new_state);
            return Err(self.violation(r, message));
        }
        match new_state {
            SessionState::GoodbyeHandshake if r.own_goodbye_sent == r.remote_sent_goodbye => {
                let message = format!(
                    "Entering {} requires exactly one goodbye (own: {}, remote: {})",
                    new_state, r.own_goodbye_sent, r.remote_sent_goodbye
                );
                return Err(self.violation(r, message));
            }
            SessionState::GoodbyeHandshakeComplete
                if !(r.own_goodbye_sent && r.remote_sent_goodbye) =>
            {
                let message = format!(
                    "Entering {} requires both goodbyes (own: {}, remote: {})",
                    new_state, r.own_goodbye_sent, r.remote_sent_goodbye
                );
                return Err(self.violation(r, message));
            }
            _ => {}
        }

        r.state = new_state;
        if new_state.is_terminal() {
            r.shutting_down = true;
        }
        debug!(
            "[{}] Session state change: {} -> {}",
            r.log_descriptor, old_state, new_state
        );
        self.state_tx.send_replace(new_state);

        self.event_handler.on_session_state_changed(old_state, new_state);
        if new_state == SessionState::Active {
            self.event_handler
                .on_session_activating(r.namespace_id.as_deref());
        }
        if old_state == SessionState::Active {
            self.event_handler.on_active_session_terminating();
        }

        if new_state.is_terminal() {
            self.transport.terminate_session();
            self.event_handler
                .on_terminal_state_reached(new_state, r.fatal_error);
        }
        Ok(())
    }
}
