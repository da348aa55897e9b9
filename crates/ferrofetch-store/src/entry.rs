//! Cache entry and statistics types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// A cached payload with its expiry bookkeeping.
///
/// `expires_at` is always `timestamp + ttl_ms`; an entry whose `expires_at`
/// is at or before the current instant must never be handed to a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    /// Creation instant, epoch milliseconds.
    pub timestamp: i64,
    pub ttl_ms: u64,
    /// Expiry instant, epoch milliseconds.
    pub expires_at: i64,
    pub hit_count: u64,
}

/// Entry as persisted by a [`KeyedStore`](crate::KeyedStore) backend.
pub type StoredEntry = CacheEntry<Value>;

impl<T> CacheEntry<T> {
    /// Creates a fresh entry stamped with the current time.
    pub fn new(key: impl Into<String>, data: T, ttl: Duration) -> Self {
        Self::created_at(key, data, ttl, now_ms())
    }

    pub fn created_at(key: impl Into<String>, data: T, ttl: Duration, timestamp: i64) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = timestamp.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX));
        Self {
            key: key.into(),
            data,
            timestamp,
            ttl_ms,
            expires_at,
            hit_count: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub const fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            key: self.key,
            data: f(self.data),
            timestamp: self.timestamp,
            ttl_ms: self.ttl_ms,
            expires_at: self.expires_at,
            hit_count: self.hit_count,
        }
    }
}

/// Per-namespace store statistics.
///
/// Hit counts are advisory: increments are issued after the read returns and
/// may not yet be visible to an immediately following stats call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_not_yet_purged: usize,
    pub total_hits: u64,
}

impl StoreStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a StoredEntry>, now_ms: i64) -> Self {
        entries
            .into_iter()
            .fold(Self::default(), |mut stats, entry| {
                stats.total_entries += 1;
                if entry.is_expired_at(now_ms) {
                    stats.expired_not_yet_purged += 1;
                }
                stats.total_hits = stats.total_hits.saturating_add(entry.hit_count);
                stats
            })
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}
