//! Message blocks and their scheduling metadata
//!
//! The byte layout of a [`MessageBlock`] is owned by the transport; this crate
//! only looks at the message type to tell goodbye messages apart from regular
//! traffic during shutdown.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identifier of a virtual channel within an uplink connection
pub type ChannelId = u64;

/// The channel used for session-level traffic (handshake, goodbye, channel setup)
pub const DEFAULT_CHANNEL_ID: ChannelId = 0;

/// One opaque unit of payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    message_type: u8,
    data: Bytes,
}

impl MessageBlock {
    /// Message type code of regular and error goodbye messages
    pub const GOODBYE_TYPE: u8 = 0xFF;

    /// Create a message block of the given type
    pub fn new(message_type: u8, data: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            data: data.into(),
        }
    }

    /// Create an empty (regular) goodbye message block
    pub fn goodbye() -> Self {
        Self::new(Self::GOODBYE_TYPE, Bytes::new())
    }

    /// The message type code
    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    /// The payload
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload length in bytes
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Whether this block is a goodbye message
    pub fn is_goodbye(&self) -> bool {
        self.message_type == Self::GOODBYE_TYPE
    }
}

/// Scheduling priority of an outbound message block
///
/// Ordered from lowest to highest; the outbox always serves the highest
/// non-empty level first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// Bulk data such as file transfers
    Low,
    /// Regular traffic
    Normal,
    /// Latency-sensitive traffic such as execution control
    High,
    /// Session-level traffic that must never wait behind payload data
    Critical,
}

impl MessagePriority {
    /// All levels, lowest first
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Low,
        MessagePriority::Normal,
        MessagePriority::High,
        MessagePriority::Critical,
    ];

    /// Number of priority levels
    pub const COUNT: usize = Self::ALL.len();

    /// Position of this level in [`MessagePriority::ALL`]
    pub fn index(self) -> usize {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Critical => 3,
        }
    }

    /// Look up a level by its index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A message block waiting in the outbox, together with its routing data
#[derive(Debug, Clone)]
pub struct MessageBlockWithMetadata {
    /// Destination channel
    pub channel_id: ChannelId,
    /// The payload
    pub block: MessageBlock,
    /// Scheduling priority
    pub priority: MessagePriority,
    /// When the block was handed to the outbox
    pub enqueued_at: Instant,
}

impl MessageBlockWithMetadata {
    /// Wrap a block, stamping it with the current time
    pub fn new(channel_id: ChannelId, block: MessageBlock, priority: MessagePriority) -> Self {
        Self {
            channel_id,
            block,
            priority,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent waiting since the block was enqueued
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}
