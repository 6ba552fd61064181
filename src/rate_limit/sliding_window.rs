//! Time-decayed sliding window limiter
//!
//! Each client holds a token balance that regains `limit_per_second` per
//! elapsed second (clamped to the limit) and loses one per request. A
//! request that drives the balance negative is denied, but the deficit is
//! kept so a client hammering the API stays throttled until it slows down.
//! Entries live in a bounded LRU cache and expire after a period of
//! inactivity.

use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock_utils::lock_or_recover;

/// Default requests per second per client
pub const DEFAULT_LIMIT_PER_SECOND: f64 = 20.0;

/// Default number of tracked clients
pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// Default inactivity before an entry is forgotten
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    /// Remaining balance, may be negative
    tokens: f64,
    last_seen: Instant,
}

/// Per-IP sliding window limiter
pub struct SlidingWindowLimiter {
    limit_per_second: f64,
    ttl: Duration,
    entries: Mutex<LruCache<IpAddr, WindowEntry>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit_per_second: f64, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            limit_per_second,
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Check and record one request from `ip`
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut entries = lock_or_recover(&self.entries, "sliding window");

        let live = entries
            .peek(&ip)
            .map(|entry| now.saturating_duration_since(entry.last_seen) <= self.ttl)
            .unwrap_or(false);

        if !live {
            entries.put(
                ip,
                WindowEntry {
                    tokens: self.limit_per_second - 1.0,
                    last_seen: now,
                },
            );
            return true;
        }

        let Some(entry) = entries.get_mut(&ip) else {
            return true;
        };

        let elapsed = now.saturating_duration_since(entry.last_seen).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * self.limit_per_second).min(self.limit_per_second);
        entry.tokens -= 1.0;
        entry.last_seen = now;

        entry.tokens >= 0.0
    }

    /// Drop entries idle for longer than the TTL. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = lock_or_recover(&self.entries, "sliding window");
        let expired: Vec<IpAddr> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > self.ttl)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &expired {
            entries.pop(ip);
        }
        expired.len()
    }

    /// Number of tracked clients
    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries, "sliding window").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(
            DEFAULT_LIMIT_PER_SECOND,
            DEFAULT_CACHE_CAPACITY,
            DEFAULT_ENTRY_TTL,
        )
    }
}
