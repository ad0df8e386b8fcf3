//! User Directory
//!
//! Durable user records with the online/lastSeen presence fallback. The
//! in-memory registry is the live source of truth for "online right now";
//! the directory's `online` flag is kept eventually consistent with it
//! (set on registration, cleared and stamped with `last_seen` on removal)
//! so offline queries still have something to report.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};

use crate::protocol::now_secs;

/// A durable user record.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub online: bool,
    pub last_seen_secs: u64,
}

impl UserRecord {
    /// Creates a new offline user record stamped with the current time.
    pub fn new(id: impl Into<String>, username: impl Into<String>, email: impl Into<String>) -> Self {
        UserRecord {
            id: id.into(),
            username: username.into(),
            email: email.into(),
            online: false,
            last_seen_secs: now_secs(),
        }
    }
}

/// Trait for user directory backends.
pub trait UserDirectory: Send + Sync {
    /// Inserts or replaces a user record.
    fn insert(&self, user: UserRecord);

    /// Looks up a user by id.
    fn get(&self, user_id: &str) -> Option<UserRecord>;

    /// Returns true if the user id resolves.
    fn exists(&self, user_id: &str) -> bool;

    /// Marks the user online. Returns false if the user is unknown.
    fn set_online(&self, user_id: &str) -> bool;

    /// Marks the user offline and stamps last_seen. Returns false if unknown.
    fn set_offline(&self, user_id: &str, last_seen_secs: u64) -> bool;

    /// User ids whose durable record currently says online.
    fn online_user_ids(&self) -> Vec<String>;

    /// Total number of users.
    fn user_count(&self) -> usize;
}

// ============================================================================
// In-Memory Directory (for testing and development)
// ============================================================================

/// In-memory user directory indexed by user id.
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        MemoryUserDirectory {
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn insert(&self, user: UserRecord) {
        let mut users = self.users.write().unwrap();
        users.insert(user.id.clone(), user);
    }

    fn get(&self, user_id: &str) -> Option<UserRecord> {
        let users = self.users.read().unwrap();
        users.get(user_id).cloned()
    }

    fn exists(&self, user_id: &str) -> bool {
        let users = self.users.read().unwrap();
        users.contains_key(user_id)
    }

    fn set_online(&self, user_id: &str) -> bool {
        let mut users = self.users.write().unwrap();
        match users.get_mut(user_id) {
            Some(user) => {
                user.online = true;
                true
            }
            None => false,
        }
    }

    fn set_offline(&self, user_id: &str, last_seen_secs: u64) -> bool {
        let mut users = self.users.write().unwrap();
        match users.get_mut(user_id) {
            Some(user) => {
                user.online = false;
                user.last_seen_secs = last_seen_secs;
                true
            }
            None => false,
        }
    }

    fn online_user_ids(&self) -> Vec<String> {
        let users = self.users.read().unwrap();
        users
            .values()
            .filter(|u| u.online)
            .map(|u| u.id.clone())
            .collect()
    }

    fn user_count(&self) -> usize {
        let users = self.users.read().unwrap();
        users.len()
    }
}

// ============================================================================
// SQLite Directory (for production)
// ============================================================================

/// SQLite-backed persistent user directory.
pub struct SqliteUserDirectory {
    conn: Mutex<Connection>,
}

impl SqliteUserDirectory {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        // WAL allows readers and writers to operate concurrently
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL,
                online INTEGER NOT NULL DEFAULT 0,
                last_seen_secs INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(SqliteUserDirectory {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }
}

impl UserDirectory for SqliteUserDirectory {
    fn insert(&self, user: UserRecord) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "INSERT OR REPLACE INTO users (id, username, email, online, last_seen_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.username,
                user.email,
                user.online as i64,
                user.last_seen_secs as i64
            ],
        );
    }

    fn get(&self, user_id: &str) -> Option<UserRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, email, online, last_seen_secs FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    online: row.get::<_, i64>(3)? != 0,
                    last_seen_secs: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .ok()
    }

    fn exists(&self, user_id: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM users WHERE id = ?1",
            params![user_id],
            |_| Ok(()),
        )
        .is_ok()
    }

    fn set_online(&self, user_id: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET online = 1 WHERE id = ?1",
            params![user_id],
        )
        .unwrap_or(0)
            > 0
    }

    fn set_offline(&self, user_id: &str, last_seen_secs: u64) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET online = 0, last_seen_secs = ?2 WHERE id = ?1",
            params![user_id, last_seen_secs as i64],
        )
        .unwrap_or(0)
            > 0
    }

    fn online_user_ids(&self) -> Vec<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare("SELECT id FROM users WHERE online = 1") {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        stmt.query_map([], |row| row.get(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    fn user_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type, shared by the user directory and the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a user directory based on the backend type.
pub fn create_user_directory(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Box<dyn UserDirectory> {
    match backend {
        StorageBackend::Memory => Box::new(MemoryUserDirectory::new()),
        StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("users.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("users.db"));

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            Box::new(SqliteUserDirectory::open(&path).expect("Failed to open user database"))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
