//! Keyed-store contract implemented by every cache backend.

use std::future::Future;
use std::pin::Pin;

use crate::entry::StoredEntry;
use crate::error::CacheError;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Generic namespaced key/value backend.
///
/// Backends store entries verbatim and never apply expiry themselves; TTL
/// handling lives in [`PersistentCacheStore`](crate::PersistentCacheStore).
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single handle is shared by every
/// caller of the store.
pub trait KeyedStore: Send + Sync {
    /// Short backend label used in log lines.
    fn name(&self) -> &'static str;

    fn get<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, Option<StoredEntry>>;

    /// Inserts or replaces the entry stored under `entry.key`.
    fn put<'a>(&'a self, namespace: &'a str, entry: StoredEntry) -> StoreFuture<'a, ()>;

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, ()>;

    /// Deletes `key` only if its stored entry expires at or before `now_ms`.
    ///
    /// Returns whether an entry was removed. An entry rewritten since it was
    /// read is left in place.
    fn purge_expired<'a>(&'a self, namespace: &'a str, key: &'a str, now_ms: i64) -> StoreFuture<'a, bool>;

    fn keys<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Returns every entry of a namespace, expired ones included.
    fn entries<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<StoredEntry>>;

    fn clear<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, ()>;

    /// Adds one to the hit counter of an existing entry; a missing key is not an error.
    fn increment_hits<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, ()>;
}
