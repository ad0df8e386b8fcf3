//! Rate Limiting
//!
//! Token bucket limiter applied per authenticated user. Every inbound event
//! after the handshake costs one token; typing spam and send floods hit the
//! same budget.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64) -> Self {
        TokenBucket {
            tokens: max_tokens as f64,
            max_tokens: max_tokens as f64,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-user rate limiter shared across all session tasks.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, TokenBucket>>,
    max_per_minute: u32,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            buckets: RwLock::new(HashMap::new()),
            max_per_minute,
        }
    }

    /// Tries to consume a token for this user.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn consume(&self, user_id: &str) -> bool {
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets.entry(user_id.to_string()).or_insert_with(|| {
            TokenBucket::new(self.max_per_minute, self.max_per_minute as f64 / 60.0)
        });
        bucket.try_consume()
    }

    /// Removes buckets that have not been touched for the given duration.
    /// Returns the number of buckets removed.
    pub fn cleanup_inactive(&self, max_idle: std::time::Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap();
        let now = Instant::now();
        let initial_count = buckets.len();

        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < max_idle);

        initial_count - buckets.len()
    }

    /// Number of user buckets currently tracked.
    pub fn tracked_users(&self) -> usize {
        let buckets = self.buckets.read().unwrap();
        buckets.len()
    }
}
