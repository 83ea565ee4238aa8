//! Live message ingestion.
//!
//! Turns one [`ChannelSignal`] into at most one store operation. Received
//! messages are checked against the acknowledgment index before anything
//! else happens, so a message already logged by reconciliation (or by an
//! earlier delivery of the same signal) is skipped.

use textlog_proto::channel::{ContactRef, Handle};
use textlog_proto::entry::{Direction, LogEntryText, MessageType, PendingAck};
use textlog_proto::pending::PendingMessage;
use textlog_proto::token::{MessageToken, PendingMessageId, tokenize};
use textlog_store::{AckStore, StoreError};

use crate::transport::{ChannelSignal, SentMessage, SignalKind, TextChannel};

use super::{ChannelSession, SessionError};

/// What handling one signal did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new entry was written.
    Logged(MessageToken),
    /// The message was already in the index.
    Duplicate(MessageToken),
    /// The signal is not part of the logging contract.
    Ignored(SignalKind),
    /// The message could not be logged; the session carries on.
    Dropped,
    /// This many entries were acknowledged.
    Acknowledged(usize),
}

/// Running counts of [`IngestOutcome`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestTally {
    /// New entries written.
    pub logged: usize,
    /// Messages skipped as already logged.
    pub duplicates: usize,
    /// Signals outside the logging contract.
    pub ignored: usize,
    /// Messages lost to lookup or store failures.
    pub dropped: usize,
    /// Entries acknowledged by removal signals.
    pub acknowledged: usize,
}

impl IngestTally {
    /// Counts one outcome.
    pub const fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Logged(_) => self.logged += 1,
            IngestOutcome::Duplicate(_) => self.duplicates += 1,
            IngestOutcome::Ignored(_) => self.ignored += 1,
            IngestOutcome::Dropped => self.dropped += 1,
            IngestOutcome::Acknowledged(n) => self.acknowledged += *n,
        }
    }
}

impl<C, S> ChannelSession<C, S>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    /// Handles one live signal.
    pub async fn handle_signal(&mut self, signal: ChannelSignal) -> IngestOutcome {
        match signal {
            ChannelSignal::Received(message) => self.ingest_received(&message).await,
            ChannelSignal::Sent(sent) => self.ingest_sent(sent).await,
            ChannelSignal::PendingMessagesRemoved(ids) => self.acknowledge_removed(&ids).await,
            other @ (ChannelSignal::SendError(_) | ChannelSignal::LostMessage | ChannelSignal::Closed) => {
                tracing::debug!(session = %self.id, signal = %other.kind(), "signal not logged");
                IngestOutcome::Ignored(other.kind())
            }
        }
    }

    /// Logs a received message unless its token is already present.
    pub(crate) async fn ingest_received(&mut self, message: &PendingMessage) -> IngestOutcome {
        if message.is_delivery_notification() {
            tracing::debug!(session = %self.id, id = %message.id, "skipping delivery notification");
            return IngestOutcome::Ignored(SignalKind::Received);
        }

        let token = tokenize(self.channel.path(), message.timestamp, message.id);
        match self.store.log_id_is_present(&token).await {
            Ok(true) => {
                tracing::debug!(session = %self.id, %token, "already logged");
                return IngestOutcome::Duplicate(token);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(session = %self.id, %token, error = %e, "presence check failed, dropping message");
                return IngestOutcome::Dropped;
            }
        }

        let entry = match self.inbound_entry(token, message).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(session = %self.id, id = %message.id, error = %e, "could not resolve sender, dropping message");
                return IngestOutcome::Dropped;
            }
        };
        self.insert(entry).await
    }

    /// Logs a message the local user sent; it is never pending.
    async fn ingest_sent(&mut self, sent: SentMessage) -> IngestOutcome {
        let token = tokenize(self.channel.path(), sent.timestamp, PendingMessageId::OUTGOING);
        let entry = match self.outbound_entry(token, sent) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "could not log sent message");
                return IngestOutcome::Dropped;
            }
        };
        self.insert(entry).await
    }

    /// Acknowledges every entry of this channel carrying one of `ids`.
    async fn acknowledge_removed(&self, ids: &[PendingMessageId]) -> IngestOutcome {
        let path = self.channel.path();
        let mut acknowledged = 0;
        for &id in ids {
            match self.store.set_acknowledgment_by_message_id(path, id).await {
                Ok(n) => acknowledged += n,
                Err(e) => {
                    tracing::warn!(session = %self.id, channel = %path, %id, error = %e, "could not acknowledge message");
                }
            }
        }
        tracing::debug!(session = %self.id, channel = %path, acknowledged, "pending messages removed");
        IngestOutcome::Acknowledged(acknowledged)
    }

    async fn insert(&self, entry: LogEntryText) -> IngestOutcome {
        match self.store.insert(&entry).await {
            Ok(()) => {
                tracing::debug!(session = %self.id, token = %entry.token, direction = %entry.direction, "logged message");
                IngestOutcome::Logged(entry.token)
            }
            Err(StoreError::DuplicateToken(token)) => IngestOutcome::Duplicate(token),
            Err(e) => {
                tracing::warn!(session = %self.id, token = %entry.token, error = %e, "insert failed, dropping message");
                IngestOutcome::Dropped
            }
        }
    }

    async fn inbound_entry(
        &mut self,
        token: MessageToken,
        message: &PendingMessage,
    ) -> Result<LogEntryText, SessionError> {
        let (sender, receiver) = if self.chatroom {
            (self.participant(message.sender).await?, None)
        } else {
            (
                self.remote_contact.require()?.clone(),
                Some(self.self_contact.require()?.clone()),
            )
        };
        self.entry(
            token,
            Direction::In,
            message.timestamp,
            sender,
            receiver,
            message.body.clone(),
            message.message_type,
            PendingAck::Pending(message.id),
        )
    }

    fn outbound_entry(&self, token: MessageToken, sent: SentMessage) -> Result<LogEntryText, SessionError> {
        let sender = self.self_contact.require()?.clone();
        let receiver = if self.chatroom {
            None
        } else {
            Some(self.remote_contact.require()?.clone())
        };
        self.entry(
            token,
            Direction::Out,
            sent.timestamp,
            sender,
            receiver,
            sent.body,
            sent.message_type,
            PendingAck::Acknowledged,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        token: MessageToken,
        direction: Direction,
        timestamp: i64,
        sender: ContactRef,
        receiver: Option<ContactRef>,
        body: String,
        message_type: MessageType,
        pending: PendingAck,
    ) -> Result<LogEntryText, SessionError> {
        let chat_id = if self.chatroom {
            self.chatroom_id.require()?.clone()
        } else {
            self.remote_contact.require()?.identifier.clone()
        };
        Ok(LogEntryText {
            token,
            account: self.channel.account().clone(),
            channel: self.channel.path().clone(),
            direction,
            chat_id,
            chatroom: self.chatroom,
            timestamp,
            sender,
            receiver,
            body,
            message_type,
            pending,
        })
    }

    /// Room participant for `handle`, looked up once per session.
    async fn participant(&mut self, handle: Handle) -> Result<ContactRef, SessionError> {
        if let Some(contact) = self.participants.get(&handle) {
            return Ok(contact.clone());
        }
        let contact = self.channel.resolve_contact(handle).await?;
        self.participants.insert(handle, contact.clone());
        Ok(contact)
    }
}
