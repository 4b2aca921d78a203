//! Burst limiter
//!
//! Debounces rapid-fire operations per account. The last-seen timestamp is
//! recorded on every call so a steady stream of edits keeps the window shut.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::model::{AccountId, Timestamp};

/// Default debounce window
pub const DEFAULT_BURST_WINDOW_MS: i64 = 1_000;

/// Default number of accounts tracked
pub const DEFAULT_BURST_CACHE_SIZE: usize = 10_000;

/// Per-account debounce over a bounded LRU
pub struct BurstLimiter {
    last_seen: LruCache<AccountId, Timestamp>,
    window_ms: i64,
}

impl BurstLimiter {
    pub fn new(capacity: usize, window_ms: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            last_seen: LruCache::new(capacity),
            window_ms,
        }
    }

    /// Whether an operation at `ts` counts as activity.
    ///
    /// Always records `ts` as the account's last-seen time.
    pub fn should_count(&mut self, account: &str, ts: Timestamp) -> bool {
        match self.last_seen.put(account.to_string(), ts) {
            Some(prev) => ts - prev > self.window_ms,
            None => true,
        }
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

impl Default for BurstLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BURST_CACHE_SIZE, DEFAULT_BURST_WINDOW_MS)
    }
}
