//! Transport contract for text channels.
//!
//! Defines the [`TextChannel`] trait a session drives, and the
//! [`ChannelSignal`]s a channel pushes into the session's queue once
//! subscribed. Concrete implementations:
//! - [`loopback::LoopbackChannel`]: in-process channel for tests and replay

pub mod loopback;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use textlog_proto::channel::{AccountPath, ChannelPath, ContactRef, Handle, HandleKind};
use textlog_proto::entry::MessageType;
use textlog_proto::pending::{LegacyPendingMessage, PendingMessage, RichPendingMessage};
use textlog_proto::token::PendingMessageId;

/// The live events a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// A message was received.
    Received,
    /// The local user sent a message.
    Sent,
    /// Sending a message failed.
    SendError,
    /// The transport lost a message.
    LostMessage,
    /// The channel was closed.
    Closed,
    /// Pending messages were acknowledged and left the queue.
    PendingMessagesRemoved,
}

impl SignalKind {
    /// Every kind, in subscription order.
    pub const ALL: [Self; 6] = [
        Self::Received,
        Self::Sent,
        Self::SendError,
        Self::LostMessage,
        Self::Closed,
        Self::PendingMessagesRemoved,
    ];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::SendError => "send-error",
            Self::LostMessage => "lost-message",
            Self::Closed => "closed",
            Self::PendingMessagesRemoved => "pending-messages-removed",
        };
        f.write_str(name)
    }
}

/// A message the local user sent, as echoed by the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    /// Send time, unix seconds.
    pub timestamp: i64,
    /// Message type.
    #[serde(default)]
    pub message_type: MessageType,
    /// Message text.
    pub body: String,
}

/// A failed send, as reported by the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFailure {
    /// Transport-specific error code.
    pub error: u32,
    /// Time of the failed send, unix seconds.
    pub timestamp: i64,
    /// Message type.
    #[serde(default)]
    pub message_type: MessageType,
    /// Text that could not be sent.
    pub body: String,
}

/// One live event delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSignal {
    /// A message arrived and is now pending.
    Received(PendingMessage),
    /// The local user sent a message.
    Sent(SentMessage),
    /// A send failed.
    SendError(SendFailure),
    /// The transport lost a message.
    LostMessage,
    /// The channel closed.
    Closed,
    /// These pending ids were acknowledged.
    PendingMessagesRemoved(Vec<PendingMessageId>),
}

impl ChannelSignal {
    /// The subscription this signal is delivered through.
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Received(_) => SignalKind::Received,
            Self::Sent(_) => SignalKind::Sent,
            Self::SendError(_) => SignalKind::SendError,
            Self::LostMessage => SignalKind::LostMessage,
            Self::Closed => SignalKind::Closed,
            Self::PendingMessagesRemoved(_) => SignalKind::PendingMessagesRemoved,
        }
    }
}

/// Errors reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Subscribing to a signal failed.
    #[error("could not subscribe to {0} signal")]
    Subscribe(SignalKind),

    /// Preparing the channel failed.
    #[error("channel preparation failed: {0}")]
    Prepare(String),

    /// A handle could not be resolved.
    #[error("could not resolve handle {0}")]
    UnknownHandle(Handle),

    /// Fetching the pending queue failed.
    #[error("pending message fetch failed: {0}")]
    PendingFetch(String),

    /// The channel is gone.
    #[error("channel closed")]
    Closed,
}

/// One text conversation as seen by a logging session.
///
/// Identity accessors are cheap and synchronous; everything that talks to
/// the connection is async. Signals are delivered into the queue passed to
/// [`TextChannel::connect_signal`]; a channel must tolerate that queue being
/// closed, which happens when the session gives up.
pub trait TextChannel: Send + Sync {
    /// Transport path of the channel.
    fn path(&self) -> &ChannelPath;

    /// Account the channel belongs to.
    fn account(&self) -> &AccountPath;

    /// Kind and handle of the conversation's target.
    fn target(&self) -> (HandleKind, Handle);

    /// The local user's handle on this connection.
    fn self_handle(&self) -> Handle;

    /// Waits until the channel is ready for use.
    fn prepare(&self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Routes every future `kind` signal into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Subscribe`] if the subscription is refused.
    fn connect_signal(
        &self,
        kind: SignalKind,
        sink: mpsc::Sender<ChannelSignal>,
    ) -> Result<(), TransportError>;

    /// Resolves a contact handle to its identifier and alias.
    fn resolve_contact(
        &self,
        handle: Handle,
    ) -> impl std::future::Future<Output = Result<ContactRef, TransportError>> + Send;

    /// Resolves a room handle to the room's identifier.
    fn inspect_room(
        &self,
        handle: Handle,
    ) -> impl std::future::Future<Output = Result<String, TransportError>> + Send;

    /// Whether [`TextChannel::pending_messages_rich`] is available.
    fn supports_rich_pending(&self) -> bool;

    /// Fetches the pending queue in the rich multi-part form.
    fn pending_messages_rich(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RichPendingMessage>, TransportError>> + Send;

    /// Fetches the pending queue in the legacy flat form.
    fn pending_messages_legacy(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<LegacyPendingMessage>, TransportError>> + Send;
}
