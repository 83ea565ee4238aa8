//! Acknowledgment index for logged text messages.
//!
//! Defines the [`AckStore`] trait: a persistent map from [`MessageToken`] to
//! acknowledgment state, which every ingestion path consults to decide
//! whether a message has already been logged. Entries are created pending
//! (or already acknowledged, for sent messages) and only ever transition to
//! acknowledged; they are never deleted.
//!
//! Implementations:
//! - [`memory::InMemoryAckStore`]: process-local store for tests and replay
//! - [`sqlite::SqliteAckStore`]: durable SQLite index

pub mod memory;
pub mod sqlite;

use textlog_proto::channel::ChannelPath;
use textlog_proto::entry::LogEntryText;
use textlog_proto::token::{MessageToken, PendingMessageId};

pub use memory::InMemoryAckStore;
pub use sqlite::SqliteAckStore;

/// Errors that can occur during acknowledgment index operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The requested token is not in the index.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with this token already exists.
    #[error("token {0} is already logged")]
    DuplicateToken(MessageToken),

    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored entry could not be encoded or decoded.
    #[error("entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Filesystem error while opening the store.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent token → acknowledgment-state index.
///
/// Implementations must serialize concurrent writers: several channel
/// sessions may reconcile against the same store at the same time.
pub trait AckStore: Send + Sync {
    /// Tokens still pending whose message timestamp is strictly older than
    /// `older_than` (unix seconds), optionally restricted to one channel.
    fn log_ids(
        &self,
        channel: Option<&ChannelPath>,
        older_than: i64,
    ) -> impl std::future::Future<Output = Result<Vec<MessageToken>, StoreError>> + Send;

    /// Tokens of `channel` currently marked pending.
    fn pending_messages(
        &self,
        channel: &ChannelPath,
    ) -> impl std::future::Future<Output = Result<Vec<MessageToken>, StoreError>> + Send;

    /// Marks one entry acknowledged.
    ///
    /// Acknowledging an already acknowledged entry succeeds; an unknown
    /// token is [`StoreError::NotFound`].
    fn set_acknowledgment(
        &self,
        token: &MessageToken,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Marks every pending entry of `channel` carrying `message_id`
    /// acknowledged and returns how many were transitioned.
    fn set_acknowledgment_by_message_id(
        &self,
        channel: &ChannelPath,
        message_id: PendingMessageId,
    ) -> impl std::future::Future<Output = Result<usize, StoreError>> + Send;

    /// Whether an entry exists for `token`, in any state.
    fn log_id_is_present(
        &self,
        token: &MessageToken,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Inserts a new entry in the state given by `entry.pending`.
    ///
    /// Inserting an existing token is [`StoreError::DuplicateToken`].
    fn insert(
        &self,
        entry: &LogEntryText,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
