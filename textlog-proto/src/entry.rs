//! Log entries persisted for text channels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::{AccountPath, ChannelPath, ContactRef};
use crate::token::{MessageToken, PendingMessageId};

/// Whether a message was received or sent by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Received from a remote party.
    In,
    /// Sent by the local user.
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
        }
    }
}

/// Text message type as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum MessageType {
    /// Plain message.
    #[default]
    Normal,
    /// `/me`-style action.
    Action,
    /// One-way notice.
    Notice,
    /// Automatic reply (away messages and the like).
    AutoReply,
    /// Delivery report for a previously sent message.
    DeliveryReport,
    /// Any value this crate does not know about, preserved as-is.
    Other(u32),
}

impl From<u32> for MessageType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Normal,
            1 => Self::Action,
            2 => Self::Notice,
            3 => Self::AutoReply,
            4 => Self::DeliveryReport,
            other => Self::Other(other),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Normal => 0,
            MessageType::Action => 1,
            MessageType::Notice => 2,
            MessageType::AutoReply => 3,
            MessageType::DeliveryReport => 4,
            MessageType::Other(raw) => raw,
        }
    }
}

/// Bit set of per-message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageFlags(u32);

impl MessageFlags {
    /// The message was truncated by the transport.
    pub const TRUNCATED: Self = Self(1);
    /// The message carries no text body (typically a delivery notification).
    pub const NON_TEXT_CONTENT: Self = Self(2);
    /// The message is replayed history, not a new message.
    pub const SCROLLBACK: Self = Self(4);
    /// The message was rescued from a previous channel instance.
    pub const RESCUED: Self = Self(8);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a flag set from raw wire bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` with the bits of `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Acknowledgment state recorded with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingAck {
    /// Still waiting in the channel's pending queue under this id.
    Pending(PendingMessageId),
    /// Acknowledged (or never pending, for sent messages).
    Acknowledged,
}

impl PendingAck {
    /// Whether the entry is still pending.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// One logged text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntryText {
    /// Idempotency key; doubles as the entry's id.
    pub token: MessageToken,
    /// Account owning the channel.
    pub account: AccountPath,
    /// Channel the message travelled through.
    pub channel: ChannelPath,
    /// Received or sent.
    pub direction: Direction,
    /// Peer identifier (one-to-one) or room id (chatroom).
    pub chat_id: String,
    /// Whether the channel is a chatroom.
    pub chatroom: bool,
    /// Message timestamp, unix seconds.
    pub timestamp: i64,
    /// Author of the message.
    pub sender: ContactRef,
    /// Addressee; absent for chatroom messages.
    pub receiver: Option<ContactRef>,
    /// Message text.
    pub body: String,
    /// Wire message type.
    pub message_type: MessageType,
    /// Acknowledgment state at insertion time.
    pub pending: PendingAck,
}
