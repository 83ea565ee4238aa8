//! SQLite-backed [`AckStore`] with durable persistence.
//!
//! One row per token in `message_cache`. A `NULL` `pending_msg_id` means the
//! entry is acknowledged; otherwise it holds the channel-local pending id the
//! message was logged under. The full entry is kept as JSON next to the
//! indexed columns so callers can read back what was logged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use textlog_proto::channel::ChannelPath;
use textlog_proto::entry::{LogEntryText, PendingAck};
use textlog_proto::token::{MessageToken, PendingMessageId};

use crate::{AckStore, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable acknowledgment index in a single SQLite file.
#[derive(Debug)]
pub struct SqliteAckStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteAckStore {
    /// Opens (creating if needed) the index at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        initialize_schema(&conn)?;
        tracing::info!(path = %path.display(), "opened acknowledgment index");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot create the schema.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Location of the database file; `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reads back the logged entry for `token`, with its current
    /// acknowledgment state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored JSON is corrupt.
    pub fn entry(&self, token: &MessageToken) -> Result<Option<LogEntryText>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT entry_json, pending_msg_id FROM message_cache WHERE log_id = ?1",
                params![token.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        row.map(|(json, pending)| decode_entry(&json, pending))
            .transpose()
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS message_cache (
            log_id TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            channel TEXT NOT NULL,
            date INTEGER NOT NULL,
            pending_msg_id INTEGER NULL,
            entry_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_message_cache_pending
            ON message_cache (channel, pending_msg_id);

        CREATE INDEX IF NOT EXISTS idx_message_cache_date
            ON message_cache (date);
        ",
    )?;
    Ok(())
}

fn decode_entry(json: &str, pending: Option<i64>) -> Result<LogEntryText, StoreError> {
    let mut entry: LogEntryText = serde_json::from_str(json)?;
    entry.pending = match pending {
        Some(raw) => PendingAck::Pending(pending_id_from_column(raw)?),
        None => PendingAck::Acknowledged,
    };
    Ok(entry)
}

fn pending_id_from_column(raw: i64) -> Result<PendingMessageId, StoreError> {
    u32::try_from(raw)
        .map(PendingMessageId::new)
        .map_err(|_| StoreError::ReadFailed(format!("pending id {raw} out of range")))
}

fn pending_column(state: PendingAck) -> Option<i64> {
    match state {
        PendingAck::Pending(id) => Some(i64::from(id.get())),
        PendingAck::Acknowledged => None,
    }
}

fn collect_tokens(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<MessageToken>, StoreError> {
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut tokens = Vec::new();
    for row in rows {
        tokens.push(MessageToken::from_raw(row?));
    }
    Ok(tokens)
}

impl AckStore for SqliteAckStore {
    async fn log_ids(
        &self,
        channel: Option<&ChannelPath>,
        older_than: i64,
    ) -> Result<Vec<MessageToken>, StoreError> {
        let conn = self.conn.lock();
        if let Some(channel) = channel {
            let mut stmt = conn.prepare(
                "SELECT log_id FROM message_cache
                 WHERE pending_msg_id IS NOT NULL AND channel = ?1 AND date < ?2
                 ORDER BY date, rowid",
            )?;
            collect_tokens(&mut stmt, params![channel.as_str(), older_than])
        } else {
            let mut stmt = conn.prepare(
                "SELECT log_id FROM message_cache
                 WHERE pending_msg_id IS NOT NULL AND date < ?1
                 ORDER BY date, rowid",
            )?;
            collect_tokens(&mut stmt, params![older_than])
        }
    }

    async fn pending_messages(&self, channel: &ChannelPath) -> Result<Vec<MessageToken>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT log_id FROM message_cache
             WHERE pending_msg_id IS NOT NULL AND channel = ?1
             ORDER BY rowid",
        )?;
        collect_tokens(&mut stmt, params![channel.as_str()])
    }

    async fn set_acknowledgment(&self, token: &MessageToken) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE message_cache SET pending_msg_id = NULL WHERE log_id = ?1",
            params![token.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("token {token}")));
        }
        Ok(())
    }

    async fn set_acknowledgment_by_message_id(
        &self,
        channel: &ChannelPath,
        message_id: PendingMessageId,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE message_cache SET pending_msg_id = NULL
             WHERE channel = ?1 AND pending_msg_id = ?2",
            params![channel.as_str(), i64::from(message_id.get())],
        )?;
        Ok(changed)
    }

    async fn log_id_is_present(&self, token: &MessageToken) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM message_cache WHERE log_id = ?1",
                params![token.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn insert(&self, entry: &LogEntryText) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM message_cache WHERE log_id = ?1",
                params![entry.token.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::DuplicateToken(entry.token.clone()));
        }
        tx.execute(
            "INSERT INTO message_cache (log_id, account, channel, date, pending_msg_id, entry_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.token.as_str(),
                entry.account.as_str(),
                entry.channel.as_str(),
                entry.timestamp,
                pending_column(entry.pending),
                json,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}
