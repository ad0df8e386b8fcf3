//! Message Log
//!
//! Durable append-only storage for direct messages, keyed by the
//! (sender, recipient) pair. Appending happens before any live push so a
//! crash between persist and push loses a delivery opportunity, never a
//! message. The only permitted mutations are the idempotent read-marker
//! set-add (restricted to the recipient) and the sender's own tombstone.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::protocol::now_secs;
use crate::users::StorageBackend;

/// Maximum message length in characters, after trimming.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Content a tombstoned message is rewritten to.
pub const DELETED_SENTINEL: &str = "This message was deleted";

/// Message kind marker carried on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            _ => MessageKind::Text,
        }
    }
}

/// A stored direct message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub kind: MessageKind,
    /// User ids that have read this message. Grows monotonically and only
    /// ever contains the recipient.
    pub read_by: Vec<String>,
    pub created_at_secs: u64,
    pub deleted: bool,
}

impl StoredMessage {
    /// Creates a new unread message stamped with the current time.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            kind,
            read_by: Vec::new(),
            created_at_secs: now_secs(),
            deleted: false,
        }
    }
}

/// Trait for message log backends.
pub trait MessageStore: Send + Sync {
    /// Appends a message. Returns false if the write failed.
    fn append(&self, msg: StoredMessage) -> bool;

    /// Looks up a message by id.
    fn get(&self, message_id: &str) -> Option<StoredMessage>;

    /// Messages between two users in append order, newest last, capped at
    /// `limit`. This is the recipient's recovery path after missing live
    /// deliveries.
    fn conversation(&self, user_a: &str, user_b: &str, limit: usize) -> Vec<StoredMessage>;

    /// Adds the reader to the read markers of the given messages. Idempotent
    /// set-add, and only messages addressed to the reader are touched.
    /// Returns the number of messages newly marked.
    fn mark_read(&self, message_ids: &[String], reader_id: &str) -> usize;

    /// Replaces a message's content with the deletion sentinel. Only the
    /// original sender may do this. Returns false otherwise.
    fn tombstone(&self, message_id: &str, requester_id: &str) -> bool;

    /// Number of undeleted messages addressed to the user and not yet read.
    fn unread_count(&self, user_id: &str) -> usize;

    /// Total number of stored messages.
    fn message_count(&self) -> usize;
}

// ============================================================================
// In-Memory Log (for testing and development)
// ============================================================================

/// In-memory message log in append order.
pub struct MemoryMessageStore {
    log: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        MemoryMessageStore {
            log: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, msg: StoredMessage) -> bool {
        let mut log = self.log.write().unwrap();
        log.push(msg);
        true
    }

    fn get(&self, message_id: &str) -> Option<StoredMessage> {
        let log = self.log.read().unwrap();
        log.iter().find(|m| m.id == message_id).cloned()
    }

    fn conversation(&self, user_a: &str, user_b: &str, limit: usize) -> Vec<StoredMessage> {
        let log = self.log.read().unwrap();
        let matching: Vec<StoredMessage> = log
            .iter()
            .filter(|m| {
                (m.sender_id == user_a && m.recipient_id == user_b)
                    || (m.sender_id == user_b && m.recipient_id == user_a)
            })
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    fn mark_read(&self, message_ids: &[String], reader_id: &str) -> usize {
        let ids: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut log = self.log.write().unwrap();
        let mut marked = 0;
        for msg in log.iter_mut() {
            // Only the recipient can appear in read_by
            if ids.contains(msg.id.as_str())
                && msg.recipient_id == reader_id
                && !msg.read_by.iter().any(|r| r == reader_id)
            {
                msg.read_by.push(reader_id.to_string());
                marked += 1;
            }
        }
        marked
    }

    fn tombstone(&self, message_id: &str, requester_id: &str) -> bool {
        let mut log = self.log.write().unwrap();
        for msg in log.iter_mut() {
            if msg.id == message_id && msg.sender_id == requester_id && !msg.deleted {
                msg.content = DELETED_SENTINEL.to_string();
                msg.deleted = true;
                return true;
            }
        }
        false
    }

    fn unread_count(&self, user_id: &str) -> usize {
        let log = self.log.read().unwrap();
        log.iter()
            .filter(|m| {
                m.recipient_id == user_id
                    && !m.deleted
                    && !m.read_by.iter().any(|r| r == user_id)
            })
            .count()
    }

    fn message_count(&self) -> usize {
        let log = self.log.read().unwrap();
        log.len()
    }
}

// ============================================================================
// SQLite Log (for production)
// ============================================================================

/// SQLite-backed persistent message log.
///
/// Read markers live in their own table so the set-add is a natural
/// `INSERT OR IGNORE` and the recipient restriction is a WHERE clause.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                content TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at_secs INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS read_markers (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            )",
            [],
        )?;

        // Conversation queries filter on both directions of a pair
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair
             ON messages(sender_id, recipient_id, created_at_secs)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id)",
            [],
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }

    fn read_by(conn: &Connection, message_id: &str) -> Vec<String> {
        let mut stmt = match conn.prepare("SELECT user_id FROM read_markers WHERE message_id = ?1")
        {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![message_id], |row| row.get(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    fn row_to_message(conn: &Connection, row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        let id: String = row.get(0)?;
        let read_by = Self::read_by(conn, &id);
        Ok(StoredMessage {
            id,
            sender_id: row.get(1)?,
            recipient_id: row.get(2)?,
            content: row.get(3)?,
            kind: MessageKind::from_str(&row.get::<_, String>(4)?),
            read_by,
            created_at_secs: row.get::<_, i64>(5)? as u64,
            deleted: row.get::<_, i64>(6)? != 0,
        })
    }
}

impl MessageStore for SqliteMessageStore {
    fn append(&self, msg: StoredMessage) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, sender_id, recipient_id, content, kind, created_at_secs, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.id,
                msg.sender_id,
                msg.recipient_id,
                msg.content,
                msg.kind.as_str(),
                msg.created_at_secs as i64,
                msg.deleted as i64
            ],
        )
        .map(|rows| rows == 1)
        .unwrap_or(false)
    }

    fn get(&self, message_id: &str) -> Option<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, sender_id, recipient_id, content, kind, created_at_secs, deleted
                 FROM messages WHERE id = ?1",
                params![message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .ok()?;

        let read_by = Self::read_by(&conn, &row.0);
        Some(StoredMessage {
            id: row.0,
            sender_id: row.1,
            recipient_id: row.2,
            content: row.3,
            kind: MessageKind::from_str(&row.4),
            read_by,
            created_at_secs: row.5 as u64,
            deleted: row.6 != 0,
        })
    }

    fn conversation(&self, user_a: &str, user_b: &str, limit: usize) -> Vec<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, sender_id, recipient_id, content, kind, created_at_secs, deleted
             FROM (
                 SELECT *, rowid AS seq FROM messages
                 WHERE (sender_id = ?1 AND recipient_id = ?2)
                    OR (sender_id = ?2 AND recipient_id = ?1)
                 ORDER BY seq DESC LIMIT ?3
             ) ORDER BY seq ASC",
        ) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };

        let rows: Vec<StoredMessage> = stmt
            .query_map(params![user_a, user_b, limit as i64], |row| {
                Self::row_to_message(&conn, row)
            })
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default();
        rows
    }

    fn mark_read(&self, message_ids: &[String], reader_id: &str) -> usize {
        let conn = self.conn.lock().unwrap();
        let mut marked = 0;
        for id in message_ids {
            // The WHERE clause enforces that only the recipient is recorded;
            // INSERT OR IGNORE makes repeats a no-op.
            marked += conn
                .execute(
                    "INSERT OR IGNORE INTO read_markers (message_id, user_id)
                     SELECT id, ?2 FROM messages WHERE id = ?1 AND recipient_id = ?2",
                    params![id, reader_id],
                )
                .unwrap_or(0);
        }
        marked
    }

    fn tombstone(&self, message_id: &str, requester_id: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET content = ?3, deleted = 1
             WHERE id = ?1 AND sender_id = ?2 AND deleted = 0",
            params![message_id, requester_id, DELETED_SENTINEL],
        )
        .unwrap_or(0)
            > 0
    }

    fn unread_count(&self, user_id: &str) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.recipient_id = ?1 AND m.deleted = 0
               AND NOT EXISTS (
                   SELECT 1 FROM read_markers r
                   WHERE r.message_id = m.id AND r.user_id = ?1
               )",
            params![user_id],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }

    fn message_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Box<dyn MessageStore> {
    match backend {
        StorageBackend::Memory => Box::new(MemoryMessageStore::new()),
        StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("messages.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("messages.db"));

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            Box::new(SqliteMessageStore::open(&path).expect("Failed to open message database"))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
