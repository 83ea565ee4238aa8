//! In-memory implementation of [`AckStore`].
//!
//! Entries live in a `HashMap` keyed by token behind a single async mutex,
//! which serializes every reader and writer. Acknowledgments update the
//! stored entry in place, so [`InMemoryAckStore::entry`] and
//! [`InMemoryAckStore::entries`] return the current acknowledgment state.
//! Nothing survives the process; use
//! [`SqliteAckStore`](crate::SqliteAckStore) for a durable index.

use std::collections::HashMap;

use tokio::sync::Mutex;

use textlog_proto::channel::ChannelPath;
use textlog_proto::entry::{LogEntryText, PendingAck};
use textlog_proto::token::{MessageToken, PendingMessageId};

use crate::{AckStore, StoreError};

#[derive(Debug, Clone)]
struct Slot {
    entry: LogEntryText,
    /// Insertion sequence, so listings come back in logging order.
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<MessageToken, Slot>,
    next_seq: u64,
}

/// Process-local acknowledgment index.
#[derive(Debug, Default)]
pub struct InMemoryAckStore {
    inner: Mutex<Inner>,
}

impl InMemoryAckStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current acknowledgment state of `token`, if logged.
    pub async fn ack_state(&self, token: &MessageToken) -> Option<PendingAck> {
        self.inner.lock().await.slots.get(token).map(|s| s.entry.pending)
    }

    /// The logged entry for `token`, if any, with its current
    /// acknowledgment state.
    pub async fn entry(&self, token: &MessageToken) -> Option<LogEntryText> {
        self.inner
            .lock()
            .await
            .slots
            .get(token)
            .map(|s| s.entry.clone())
    }

    /// Every entry of `channel`, in insertion order, with current
    /// acknowledgment states.
    pub async fn entries(&self, channel: &ChannelPath) -> Vec<LogEntryText> {
        let inner = self.inner.lock().await;
        let mut slots: Vec<&Slot> = inner
            .slots
            .values()
            .filter(|s| s.entry.channel == *channel)
            .collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.entry.clone()).collect()
    }

    /// Total number of entries in the store.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl AckStore for InMemoryAckStore {
    async fn log_ids(
        &self,
        channel: Option<&ChannelPath>,
        older_than: i64,
    ) -> Result<Vec<MessageToken>, StoreError> {
        let inner = self.inner.lock().await;
        let mut hits: Vec<&Slot> = inner
            .slots
            .values()
            .filter(|s| s.entry.pending.is_pending())
            .filter(|s| s.entry.timestamp < older_than)
            .filter(|s| channel.is_none_or(|c| s.entry.channel == *c))
            .collect();
        hits.sort_by_key(|s| (s.entry.timestamp, s.seq));
        Ok(hits.into_iter().map(|s| s.entry.token.clone()).collect())
    }

    async fn pending_messages(&self, channel: &ChannelPath) -> Result<Vec<MessageToken>, StoreError> {
        let inner = self.inner.lock().await;
        let mut hits: Vec<&Slot> = inner
            .slots
            .values()
            .filter(|s| s.entry.pending.is_pending() && s.entry.channel == *channel)
            .collect();
        hits.sort_by_key(|s| s.seq);
        Ok(hits.into_iter().map(|s| s.entry.token.clone()).collect())
    }

    async fn set_acknowledgment(&self, token: &MessageToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.slots.get_mut(token) {
            Some(slot) => {
                slot.entry.pending = PendingAck::Acknowledged;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("token {token}"))),
        }
    }

    async fn set_acknowledgment_by_message_id(
        &self,
        channel: &ChannelPath,
        message_id: PendingMessageId,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut acked = 0;
        for slot in inner.slots.values_mut() {
            if slot.entry.channel == *channel && slot.entry.pending == PendingAck::Pending(message_id) {
                slot.entry.pending = PendingAck::Acknowledged;
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn log_id_is_present(&self, token: &MessageToken) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.slots.contains_key(token))
    }

    async fn insert(&self, entry: &LogEntryText) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.slots.contains_key(&entry.token) {
            return Err(StoreError::DuplicateToken(entry.token.clone()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.insert(
            entry.token.clone(),
            Slot {
                entry: entry.clone(),
                seq,
            },
        );
        Ok(())
    }
}
