// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence Registry
//!
//! Shared map from user id to live connection. Each session task owns the
//! write half of its socket; the registry holds an mpsc sender per user so
//! other tasks can push pre-encoded frames without touching the socket.
//!
//! A user has at most one live connection. Registering again overwrites the
//! previous entry, which orphans the old session's receiver and lets its
//! task observe the channel closing.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

/// Buffered frames per connection before pushes start failing.
const CHANNEL_CAPACITY: usize = 64;

/// A pre-encoded wire frame bound for one connection's socket.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub data: Vec<u8>,
}

/// Metadata for a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Random per-connection id, used for log correlation and to guard
    /// teardown against removing a successor's entry.
    pub connection_id: String,
    pub user_id: String,
    pub established_at_secs: u64,
}

struct PresenceEntry {
    meta: ConnectionMeta,
    tx: mpsc::Sender<OutboundFrame>,
}

/// Registry of online users and their delivery channels.
pub struct PresenceRegistry {
    entries: RwLock<HashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        PresenceRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connection and returns the receiver its session task
    /// drains. An existing entry for the same user is overwritten
    /// unconditionally; the newest connection wins.
    pub fn register(&self, meta: ConnectionMeta) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut entries = self.entries.write().unwrap();
        if let Some(previous) = entries.insert(
            meta.user_id.clone(),
            PresenceEntry {
                meta: meta.clone(),
                tx,
            },
        ) {
            // Connection ids from the server are uuids, but the field is
            // public; never slice blindly
            let old_id = &previous.meta.connection_id;
            let new_id = &meta.connection_id;
            debug!(
                "Connection {} superseded by {} for the same user",
                old_id.get(..8).unwrap_or(old_id),
                new_id.get(..8).unwrap_or(new_id)
            );
        }
        rx
    }

    /// Connection metadata for a user, if online.
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionMeta> {
        let entries = self.entries.read().unwrap();
        entries.get(user_id).map(|e| e.meta.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let entries = self.entries.read().unwrap();
        entries.contains_key(user_id)
    }

    /// Removes a user's entry. No-op if absent.
    pub fn remove(&self, user_id: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(user_id);
    }

    /// Removes the entry only if it still belongs to the given connection.
    /// Teardown of a superseded session must not evict its successor.
    /// Returns true if an entry was removed.
    pub fn remove_if(&self, user_id: &str, connection_id: &str) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get(user_id) {
            Some(entry) if entry.meta.connection_id == connection_id => {
                entries.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// User ids of everyone currently online, in no particular order.
    pub fn snapshot(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        entries.keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        let entries = self.entries.read().unwrap();
        entries.len()
    }

    /// Pushes a frame to a user's connection. Returns true on success.
    ///
    /// A closed channel means the session task is gone without having
    /// deregistered yet; the stale entry is removed on the spot. A full
    /// channel fails the push but keeps the entry, the connection may
    /// just be slow.
    pub fn push(&self, user_id: &str, frame: OutboundFrame) -> bool {
        let result = {
            let entries = self.entries.read().unwrap();
            match entries.get(user_id) {
                Some(entry) => entry.tx.try_send(frame),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dropping dead channel for a disconnected user");
                self.remove(user_id);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => false,
        }
    }

    /// Pushes a frame to every online user except one, typically the
    /// originator of a presence change. Entries whose channels turn out
    /// to be closed are removed after the sweep.
    pub fn broadcast_except(&self, excluded_user_id: &str, frame: &OutboundFrame) {
        let mut dead = Vec::new();
        {
            let entries = self.entries.read().unwrap();
            for (user_id, entry) in entries.iter() {
                if user_id == excluded_user_id {
                    continue;
                }
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    entry.tx.try_send(frame.clone())
                {
                    dead.push(user_id.clone());
                }
            }
        }
        for user_id in dead {
            self.remove(&user_id);
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
