//! Pending-message snapshots and their normalization.
//!
//! Channels report the messages still waiting in their pending queue in one
//! of two shapes:
//!
//! - the **rich** form: each message is a list of parts, part 0 holding the
//!   headers and part 1 the first (most faithful) body alternative;
//! - the **legacy** form: a flat `(id, timestamp, sender, type, flags, text)`
//!   record.
//!
//! Both are converted into one [`PendingMessage`] before any dedup logic
//! looks at them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::channel::Handle;
use crate::entry::{MessageFlags, MessageType};
use crate::token::PendingMessageId;

/// Header carrying the pending id.
pub const HEADER_PENDING_ID: &str = "pending-message-id";
/// Header carrying the receive timestamp (unix seconds).
pub const HEADER_RECEIVED: &str = "message-received";
/// Header carrying the sender handle.
pub const HEADER_SENDER: &str = "message-sender";
/// Optional header carrying the message type.
pub const HEADER_TYPE: &str = "message-type";
/// Optional boolean header: rescued from a previous channel.
pub const HEADER_RESCUED: &str = "rescued";
/// Optional boolean header: replayed history.
pub const HEADER_SCROLLBACK: &str = "scrollback";
/// Body-part key carrying the text.
pub const PART_CONTENT: &str = "content";

/// Errors raised while normalizing a rich pending message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The message has no header part at all.
    #[error("pending message has no header part")]
    NoHeaders,

    /// A mandatory header is absent.
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    /// A header is present with an unexpected type or out-of-range value.
    #[error("header {0} has the wrong type")]
    WrongType(&'static str),
}

/// A single value inside a message part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartValue {
    /// Boolean value.
    Bool(bool),
    /// Unsigned integer value.
    UInt(u64),
    /// String value.
    Text(String),
}

/// One part of a rich message: a key/value map.
pub type MessagePart = BTreeMap<String, PartValue>;

/// A pending message in the rich, multi-part form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RichPendingMessage {
    /// Part 0 holds headers, the following parts hold body alternatives.
    pub parts: Vec<MessagePart>,
}

/// A pending message in the legacy flat form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyPendingMessage {
    /// Pending id.
    pub id: u32,
    /// Receive timestamp, unix seconds.
    pub timestamp: u32,
    /// Sender handle.
    pub sender: u32,
    /// Raw message type.
    pub message_type: u32,
    /// Raw flag bits.
    pub flags: u32,
    /// Message text.
    pub text: String,
}

/// The normalized pending-message record every ingestion path works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Pending id assigned by the transport.
    pub id: PendingMessageId,
    /// Receive timestamp, unix seconds.
    pub timestamp: i64,
    /// Sender handle.
    pub sender: Handle,
    /// Message type.
    #[serde(default)]
    pub message_type: MessageType,
    /// Message flags.
    #[serde(default)]
    pub flags: MessageFlags,
    /// Message text (empty for non-text content).
    #[serde(default)]
    pub body: String,
}

impl PendingMessage {
    /// Whether this record is a delivery notification rather than a message.
    #[must_use]
    pub fn is_delivery_notification(&self) -> bool {
        self.flags.contains(MessageFlags::NON_TEXT_CONTENT)
            || self.message_type == MessageType::DeliveryReport
    }
}

impl From<LegacyPendingMessage> for PendingMessage {
    fn from(msg: LegacyPendingMessage) -> Self {
        Self {
            id: PendingMessageId::new(msg.id),
            timestamp: i64::from(msg.timestamp),
            sender: Handle::new(msg.sender),
            message_type: MessageType::from(msg.message_type),
            flags: MessageFlags::from_bits(msg.flags),
            body: msg.text,
        }
    }
}

impl TryFrom<RichPendingMessage> for PendingMessage {
    type Error = WireError;

    fn try_from(msg: RichPendingMessage) -> Result<Self, Self::Error> {
        let mut parts = msg.parts.into_iter();
        let headers = parts.next().ok_or(WireError::NoHeaders)?;

        let id = header_u32(&headers, HEADER_PENDING_ID)?.ok_or(WireError::MissingHeader(HEADER_PENDING_ID))?;
        let received = match headers.get(HEADER_RECEIVED) {
            Some(PartValue::UInt(v)) => {
                i64::try_from(*v).map_err(|_| WireError::WrongType(HEADER_RECEIVED))?
            }
            Some(_) => return Err(WireError::WrongType(HEADER_RECEIVED)),
            None => return Err(WireError::MissingHeader(HEADER_RECEIVED)),
        };
        let sender = header_u32(&headers, HEADER_SENDER)?.ok_or(WireError::MissingHeader(HEADER_SENDER))?;
        let message_type = header_u32(&headers, HEADER_TYPE)?.map_or(MessageType::Normal, MessageType::from);

        let mut flags = MessageFlags::empty();
        if header_bool(&headers, HEADER_RESCUED)? {
            flags = flags.with(MessageFlags::RESCUED);
        }
        if header_bool(&headers, HEADER_SCROLLBACK)? {
            flags = flags.with(MessageFlags::SCROLLBACK);
        }

        // TODO: alternatives beyond part 1 and attachments are not inspected.
        let body = match parts.next().as_ref().and_then(|p| p.get(PART_CONTENT)) {
            Some(PartValue::Text(text)) => text.clone(),
            _ => {
                flags = flags.with(MessageFlags::NON_TEXT_CONTENT);
                String::new()
            }
        };

        Ok(Self {
            id: PendingMessageId::new(id),
            timestamp: received,
            sender: Handle::new(sender),
            message_type,
            flags,
            body,
        })
    }
}

fn header_u32(headers: &MessagePart, key: &'static str) -> Result<Option<u32>, WireError> {
    match headers.get(key) {
        None => Ok(None),
        Some(PartValue::UInt(v)) => u32::try_from(*v).map(Some).map_err(|_| WireError::WrongType(key)),
        Some(_) => Err(WireError::WrongType(key)),
    }
}

fn header_bool(headers: &MessagePart, key: &'static str) -> Result<bool, WireError> {
    match headers.get(key) {
        None => Ok(false),
        Some(PartValue::Bool(b)) => Ok(*b),
        Some(_) => Err(WireError::WrongType(key)),
    }
}

/// A channel's pending queue as fetched in one of the two wire shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingSnapshot {
    /// Rich multi-part form.
    Rich(Vec<RichPendingMessage>),
    /// Legacy flat form.
    Legacy(Vec<LegacyPendingMessage>),
}

impl PendingSnapshot {
    /// Number of records in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Rich(v) => v.len(),
            Self::Legacy(v) => v.len(),
        }
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalizes every record, preserving order.
    ///
    /// Malformed rich records are returned as errors in place so the caller
    /// can report and skip them.
    #[must_use]
    pub fn normalize(self) -> Vec<Result<PendingMessage, WireError>> {
        match self {
            Self::Rich(v) => v.into_iter().map(PendingMessage::try_from).collect(),
            Self::Legacy(v) => v.into_iter().map(|m| Ok(PendingMessage::from(m))).collect(),
        }
    }
}
