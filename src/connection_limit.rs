//! Connection Limiting
//!
//! Caps concurrent sessions so a connect flood cannot exhaust file
//! descriptors or memory. Slots are RAII guards held by session tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks and enforces the concurrent session cap.
#[derive(Clone)]
pub struct ConnectionLimiter {
    inner: Arc<ConnectionLimiterInner>,
}

struct ConnectionLimiterInner {
    active: AtomicUsize,
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            inner: Arc::new(ConnectionLimiterInner {
                active: AtomicUsize::new(0),
                max_connections,
            }),
        }
    }

    /// Tries to acquire a session slot.
    ///
    /// Returns `None` at capacity. The guard releases the slot on drop.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        loop {
            let current = self.inner.active.load(Ordering::SeqCst);
            if current >= self.inner.max_connections {
                return None;
            }

            if self
                .inner
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(ConnectionGuard {
                    inner: self.inner.clone(),
                });
            }
            // CAS lost to another task, retry
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

/// RAII guard that releases the session slot on drop.
pub struct ConnectionGuard {
    inner: Arc<ConnectionLimiterInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
