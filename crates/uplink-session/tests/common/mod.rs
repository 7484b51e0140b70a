//! Shared fixtures for the uplink-session integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::Level;

use uplink_session::logging::{setup_logging, LoggingConfig};
use uplink_session::prelude::*;

/// Transport double that records everything written to it
pub struct MockTransport {
    sent: Mutex<Vec<(ChannelId, MessageBlock)>>,
    send_attempts: AtomicUsize,
    goodbye_attempts: AtomicUsize,
    terminations: AtomicUsize,
    goodbye_succeeds: AtomicBool,
    fail_sends: AtomicBool,
    /// One permit per send allowed to complete
    gate: Semaphore,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_gate(Semaphore::MAX_PERMITS))
    }

    /// A transport whose sends stall until [`MockTransport::release`] is called
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::with_gate(0))
    }

    fn with_gate(permits: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            send_attempts: AtomicUsize::new(0),
            goodbye_attempts: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            goodbye_succeeds: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            gate: Semaphore::new(permits),
        }
    }

    pub fn release(&self, sends: usize) {
        self.gate.add_permits(sends);
    }

    pub fn set_goodbye_succeeds(&self, succeeds: bool) {
        self.goodbye_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(ChannelId, MessageBlock)> {
        self.sent.lock().clone()
    }

    /// Message types of all sent blocks, in write order
    pub fn sent_types(&self) -> Vec<u8> {
        self.sent.lock().iter().map(|(_, block)| block.message_type()).collect()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn goodbye_attempts(&self) -> usize {
        self.goodbye_attempts.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UplinkTransport for MockTransport {
    async fn send_message_block(
        &self,
        channel_id: ChannelId,
        block: MessageBlock,
    ) -> std::result::Result<(), TransportError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|_| TransportError::Closed)?;
        permit.forget();
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset by peer",
            )));
        }
        self.sent.lock().push((channel_id, block));
        Ok(())
    }

    async fn attempt_to_send_regular_goodbye_message(&self) -> bool {
        self.goodbye_attempts.fetch_add(1, Ordering::SeqCst);
        self.goodbye_succeeds.load(Ordering::SeqCst)
    }

    fn terminate_session(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Event handler that records every callback
#[derive(Default)]
pub struct RecordingEventHandler {
    pub changes: Mutex<Vec<(SessionState, SessionState)>>,
    pub terminal: Mutex<Vec<(SessionState, Option<FatalErrorKind>)>>,
    pub activations: Mutex<Vec<Option<String>>>,
    pub terminating: AtomicUsize,
}

impl RecordingEventHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn visited_states(&self) -> Vec<SessionState> {
        self.changes.lock().iter().map(|(_, new)| *new).collect()
    }

    pub fn terminal_events(&self) -> Vec<(SessionState, Option<FatalErrorKind>)> {
        self.terminal.lock().clone()
    }
}

impl SessionEventHandler for RecordingEventHandler {
    fn on_session_state_changed(&self, old_state: SessionState, new_state: SessionState) {
        self.changes.lock().push((old_state, new_state));
    }

    fn on_terminal_state_reached(&self, state: SessionState, fatal_error: Option<FatalErrorKind>) {
        self.terminal.lock().push((state, fatal_error));
    }

    fn on_session_activating(&self, namespace_id: Option<&str>) {
        self.activations.lock().push(namespace_id.map(str::to_string));
    }

    fn on_active_session_terminating(&self) {
        self.terminating.fetch_add(1, Ordering::SeqCst);
    }
}

/// Message handler that records received blocks and fails on a chosen type
#[derive(Default)]
pub struct RecordingMessageHandler {
    pub received: Mutex<Vec<(ChannelId, MessageBlock)>>,
    pub fail_on_type: Mutex<Option<u8>>,
}

impl RecordingMessageHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received_types(&self) -> Vec<u8> {
        self.received.lock().iter().map(|(_, block)| block.message_type()).collect()
    }
}

#[async_trait]
impl MessageBlockHandler for RecordingMessageHandler {
    async fn handle_message_block(
        &self,
        channel_id: ChannelId,
        block: MessageBlock,
    ) -> anyhow::Result<()> {
        if *self.fail_on_type.lock() == Some(block.message_type()) {
            anyhow::bail!("rejected message type {}", block.message_type());
        }
        self.received.lock().push((channel_id, block));
        Ok(())
    }
}

/// Everything a session test needs
pub struct Harness {
    pub session: UplinkSession,
    pub transport: Arc<MockTransport>,
    pub events: Arc<RecordingEventHandler>,
    pub messages: Arc<RecordingMessageHandler>,
}

impl Harness {
    pub fn new(config: UplinkSessionConfig) -> Self {
        Self::with_transport(config, MockTransport::new())
    }

    pub fn with_transport(config: UplinkSessionConfig, transport: Arc<MockTransport>) -> Self {
        let events = RecordingEventHandler::new();
        let messages = RecordingMessageHandler::new();
        let session = UplinkSessionBuilder::new(SessionRole::Client, transport.clone())
            .with_config(config)
            .with_event_handler(events.clone())
            .with_message_handler(messages.clone())
            .build()
            .expect("valid session configuration");
        Self {
            session,
            transport,
            events,
            messages,
        }
    }

    /// Run the regular handshake sequence
    pub fn activate(&self) {
        let state = self.session.state_machine();
        state.mark_client_handshake_sent_or_received().unwrap();
        state.mark_server_handshake_sent_or_received().unwrap();
        state.mark_handshake_successful().unwrap();
        assert_eq!(self.session.state(), SessionState::Active);
    }

    pub async fn final_state(&self) -> SessionState {
        tokio::time::timeout(Duration::from_secs(60), self.session.wait_for_terminal_state())
            .await
            .expect("session did not reach a terminal state")
    }
}

/// Poll until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Install a test log subscriber; later calls are no-ops
pub fn init_test_logging() {
    let _ = setup_logging(LoggingConfig::new(Level::WARN).with_test_writer());
}
