//! Message tokens: the idempotency key shared by every ingestion path.
//!
//! A token is derived from `(channel path, timestamp, pending message id)`.
//! The timestamp is rendered at one-second resolution in local time, so two
//! messages in the same channel, in the same second and with the same id
//! produce the same token. Retransmissions carry the same id, which is what
//! makes them collapse onto one log entry.
//!
//! Outgoing messages never carry a server-assigned pending id and use
//! [`PendingMessageId::OUTGOING`] instead.

use std::fmt;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::channel::ChannelPath;

/// Local-time rendering used inside tokens.
const TOKEN_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Server-assigned id of a message waiting in a channel's pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingMessageId(u32);

impl PendingMessageId {
    /// Sentinel id used for locally sent messages.
    pub const OUTGOING: Self = Self(u32::MAX);

    /// Wraps a raw pending id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the outgoing sentinel.
    #[must_use]
    pub const fn is_outgoing(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for PendingMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque idempotency key of one logical message instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageToken(String);

impl MessageToken {
    /// Wraps an already computed token, e.g. one read back from a store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the token's string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the token for a message.
///
/// Pure and deterministic. Each field is NUL-terminated before hashing so a
/// suffix of the channel path can never be confused with a prefix of the
/// timestamp.
#[must_use]
pub fn tokenize(channel: &ChannelPath, timestamp: i64, message_id: PendingMessageId) -> MessageToken {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(token_time(timestamp).as_bytes());
    hasher.update([0u8]);
    hasher.update(message_id.get().to_string().as_bytes());
    hasher.update([0u8]);
    MessageToken(format!("{:x}", hasher.finalize()))
}

/// Renders `timestamp` (unix seconds) at one-second resolution in local time.
///
/// Instants that local time cannot represent fall back to the raw number of
/// seconds. During a DST fold the earlier mapping is used.
#[must_use]
pub fn token_time(timestamp: i64) -> String {
    Local
        .timestamp_opt(timestamp, 0)
        .earliest()
        .map_or_else(|| timestamp.to_string(), |t| t.format(TOKEN_TIME_FORMAT).to_string())
}
