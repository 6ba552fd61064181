//! Fixed-capacity token bucket
//!
//! Refill is lazy: nothing happens between calls, and each `take` credits
//! `floor(elapsed_secs * capacity / fill_per_second)` tokens, capped at
//! capacity. `last_filled` only advances when at least one token was
//! credited, so a client polling faster than one refill step still
//! accumulates time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

use crate::lock_utils::lock_or_recover;

/// Default bucket capacity
pub const DEFAULT_CAPACITY: u32 = 15;

/// Default refill parameter
pub const DEFAULT_FILL_PER_SECOND: f64 = 10.0;

/// A single client's bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    fill_per_second: f64,
    tokens: f64,
    last_filled: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, fill_per_second: f64) -> Self {
        Self::new_at(capacity, fill_per_second, Instant::now())
    }

    pub fn new_at(capacity: u32, fill_per_second: f64, now: Instant) -> Self {
        Self {
            capacity,
            fill_per_second,
            tokens: capacity as f64,
            last_filled: now,
        }
    }

    /// Consume one token if available. Never blocks.
    pub fn take(&mut self) -> bool {
        self.take_at(Instant::now())
    }

    pub fn take_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (without refilling)
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        if self.fill_per_second <= 0.0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_filled).as_secs_f64();
        let credit = (elapsed * self.capacity as f64 / self.fill_per_second).floor();
        if credit >= 1.0 {
            self.tokens = (self.tokens + credit).min(self.capacity as f64);
            self.last_filled = now;
        }
    }
}

/// Per-IP token buckets.
///
/// Buckets are created lazily and never evicted; the map grows with the
/// number of distinct clients for the lifetime of the process.
pub struct TokenBucketLimiter {
    capacity: u32,
    fill_per_second: f64,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, fill_per_second: f64) -> Self {
        Self {
            capacity,
            fill_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `ip`
    pub fn take(&self, ip: IpAddr) -> bool {
        self.take_at(ip, Instant::now())
    }

    pub fn take_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = lock_or_recover(&self.buckets, "token buckets");
        buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new_at(self.capacity, self.fill_per_second, now))
            .take_at(now)
    }

    /// Number of clients with a bucket
    pub fn tracked_ips(&self) -> usize {
        lock_or_recover(&self.buckets, "token buckets").len()
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_FILL_PER_SECOND)
    }
}
