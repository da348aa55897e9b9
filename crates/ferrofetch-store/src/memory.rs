//! In-memory keyed store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::{KeyedStore, StoreFuture};
use crate::entry::StoredEntry;
use crate::error::CacheError;

type Namespaces = HashMap<String, HashMap<String, StoredEntry>>;

/// Thread-safe in-memory backend, one map per declared namespace.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Namespaces>>,
}

impl MemoryStore {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = namespaces
            .into_iter()
            .map(|namespace| (namespace.into(), HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Number of entries in a namespace, expired entries included.
    pub async fn len(&self, namespace: &str) -> usize {
        let store = self.inner.read().await;
        store.get(namespace).map_or(0, HashMap::len)
    }
}

impl KeyedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, Option<StoredEntry>> {
        Box::pin(async move {
            let store = self.inner.read().await;
            let map = store
                .get(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            Ok(map.get(key).cloned())
        })
    }

    fn put<'a>(&'a self, namespace: &'a str, entry: StoredEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut store = self.inner.write().await;
            let map = store
                .get_mut(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            map.insert(entry.key.clone(), entry);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut store = self.inner.write().await;
            let map = store
                .get_mut(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            map.remove(key);
            Ok(())
        })
    }

    fn purge_expired<'a>(&'a self, namespace: &'a str, key: &'a str, now_ms: i64) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut store = self.inner.write().await;
            let map = store
                .get_mut(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            let expired = map.get(key).is_some_and(|entry| entry.is_expired_at(now_ms));
            if expired {
                map.remove(key);
            }
            Ok(expired)
        })
    }

    fn keys<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let store = self.inner.read().await;
            let map = store
                .get(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            Ok(keys)
        })
    }

    fn entries<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<StoredEntry>> {
        Box::pin(async move {
            let store = self.inner.read().await;
            let map = store
                .get(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            Ok(map.values().cloned().collect())
        })
    }

    fn clear<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut store = self.inner.write().await;
            let map = store
                .get_mut(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            map.clear();
            Ok(())
        })
    }

    fn increment_hits<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut store = self.inner.write().await;
            let map = store
                .get_mut(namespace)
                .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
            if let Some(entry) = map.get_mut(key) {
                entry.hit_count = entry.hit_count.saturating_add(1);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::entry::CacheEntry;

    #[tokio::test]
    async fn put_get_and_overwrite() {
        let store = MemoryStore::new(["quotes"]);

        assert!(store.get("quotes", "a").await.expect("get").is_none());

        store
            .put("quotes", CacheEntry::new("a", json!(1), Duration::from_secs(60)))
            .await
            .expect("put");
        store
            .put("quotes", CacheEntry::new("a", json!(2), Duration::from_secs(60)))
            .await
            .expect("put");

        let entry = store.get("quotes", "a").await.expect("get").expect("present");
        assert_eq!(entry.data, json!(2));
        assert_eq!(store.len("quotes").await, 1);
    }

    #[tokio::test]
    async fn undeclared_namespace_is_rejected() {
        let store = MemoryStore::new(["quotes"]);

        let error = store.keys("news").await.expect_err("news is not declared");
        assert_eq!(error, CacheError::unknown_namespace("news"));
    }

    #[tokio::test]
    async fn increment_hits_ignores_missing_keys() {
        let store = MemoryStore::new(["quotes"]);
        store
            .put("quotes", CacheEntry::new("a", json!(null), Duration::from_secs(60)))
            .await
            .expect("put");

        store.increment_hits("quotes", "a").await.expect("increment");
        store.increment_hits("quotes", "missing").await.expect("missing is fine");

        let entry = store.get("quotes", "a").await.expect("get").expect("present");
        assert_eq!(entry.hit_count, 1);
    }

    #[tokio::test]
    async fn purge_expired_spares_a_rewritten_entry() {
        let store = MemoryStore::new(["quotes"]);
        store
            .put("quotes", CacheEntry::created_at("a", json!(1), Duration::from_secs(1), 1_000))
            .await
            .expect("put");
        store
            .put("quotes", CacheEntry::created_at("a", json!(2), Duration::from_secs(60), 5_000))
            .await
            .expect("rewrite");

        let removed = store.purge_expired("quotes", "a", 5_000).await.expect("purge");

        assert!(!removed);
        let entry = store.get("quotes", "a").await.expect("get").expect("present");
        assert_eq!(entry.data, json!(2));
        assert!(store.purge_expired("quotes", "a", 65_000).await.expect("purge"));
        assert_eq!(store.len("quotes").await, 0);
    }

    #[tokio::test]
    async fn clear_only_touches_one_namespace() {
        let store = MemoryStore::new(["quotes", "news"]);
        store
            .put("quotes", CacheEntry::new("q", json!(1), Duration::from_secs(60)))
            .await
            .expect("put");
        store
            .put("news", CacheEntry::new("n", json!(1), Duration::from_secs(60)))
            .await
            .expect("put");

        store.clear("quotes").await.expect("clear");

        assert_eq!(store.len("quotes").await, 0);
        assert_eq!(store.len("news").await, 1);
    }
}
