//! Incoming event pipeline
//!
//! The (external) read loop converts what it receives into [`IncomingEvent`]s
//! and hands them to [`UplinkSession::submit_incoming_event`]. Events are
//! processed one at a time on the session's incoming queue, in reception
//! order, so the read loop is never held up by processing.

use tracing::{debug, trace};

use super::UplinkSession;
use crate::message::{ChannelId, MessageBlock};

/// Something that arrived on, or happened to, the incoming stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingEvent {
    /// A regular message block for the business layer
    MessageBlock {
        channel_id: ChannelId,
        block: MessageBlock,
    },
    /// A regular goodbye message
    RegularGoodbye,
    /// An error goodbye message carrying an `E<code>: <text>` message
    ErrorGoodbye { message: String },
    /// The response to our last heartbeat
    HeartbeatResponse,
    /// The incoming stream was closed or reached EOF
    StreamClosedOrEof,
    /// Reading from the incoming stream failed
    StreamReadError(String),
}

impl UplinkSession {
    /// Queue an incoming event for ordered processing
    ///
    /// Returns `false` if the incoming queue no longer accepts events.
    pub fn submit_incoming_event(&self, event: IncomingEvent) -> bool {
        let session = self.clone();
        self.inner
            .incoming
            .enqueue(async move { session.process_incoming_event(event).await })
    }

    async fn process_incoming_event(&self, event: IncomingEvent) -> anyhow::Result<()> {
        match event {
            IncomingEvent::MessageBlock { channel_id, block } => {
                if self.inner.state.is_in_terminal_state() {
                    debug!(
                        "[{}] Discarding incoming message block of type {} received after session end",
                        self.log_descriptor(),
                        block.message_type()
                    );
                    return Ok(());
                }
                if self.inner.config.verbose_logging {
                    trace!(
                        "[{}] Received message block of type {} ({} bytes) on channel {}",
                        self.log_descriptor(),
                        block.message_type(),
                        block.data_len(),
                        channel_id
                    );
                }
                self.inner
                    .message_handler
                    .handle_message_block(channel_id, block)
                    .await
            }
            IncomingEvent::RegularGoodbye => Ok(self.handle_regular_remote_goodbye_message()?),
            IncomingEvent::ErrorGoodbye { message } => {
                Ok(self.handle_remote_error_goodbye_message(&message)?)
            }
            IncomingEvent::HeartbeatResponse => {
                if let Some(rtt) = self.inner.state.mark_heartbeat_response_received() {
                    if self.inner.config.verbose_logging {
                        trace!(
                            "[{}] Heartbeat round trip took {} msec",
                            self.log_descriptor(),
                            rtt.as_millis()
                        );
                    }
                }
                Ok(())
            }
            IncomingEvent::StreamClosedOrEof => Ok(self.handle_incoming_stream_closed_or_eof()?),
            IncomingEvent::StreamReadError(error) => Ok(self.handle_stream_read_error(&error)?),
        }
    }
}
