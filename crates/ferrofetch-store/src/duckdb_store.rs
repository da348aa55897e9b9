//! DuckDB-file-backed keyed store.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use ::duckdb::{params, Connection};

use crate::backend::{KeyedStore, StoreFuture};
use crate::duckdb::DuckDbConnectionManager;
use crate::entry::StoredEntry;
use crate::error::CacheError;
use crate::migrations;

type RawRow = (String, String, i64, i64, i64, i64);

const SELECT_COLUMNS: &str = "key, data, created_at_ms, ttl_ms, expires_at_ms, hit_count";

/// Persistent backend storing every namespace in one `cache_entries` table.
///
/// `DuckDB` calls are synchronous, so each operation runs on the blocking pool.
#[derive(Clone)]
pub struct DuckDbStore {
    manager: DuckDbConnectionManager,
    namespaces: Arc<HashSet<String>>,
}

impl DuckDbStore {
    /// Opens the database file, applies migrations and registers `namespaces`.
    pub fn open(path: &Path, namespaces: &[String], max_pool_size: usize) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                CacheError::initialization(format!(
                    "cannot create cache directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
        let manager = DuckDbConnectionManager::open(path, max_pool_size)
            .map_err(|error| CacheError::initialization(error.to_string()))?;
        Self::initialize(manager, namespaces)
    }

    pub fn open_in_memory(namespaces: &[String]) -> Result<Self, CacheError> {
        let manager = DuckDbConnectionManager::open_in_memory(2)
            .map_err(|error| CacheError::initialization(error.to_string()))?;
        Self::initialize(manager, namespaces)
    }

    fn initialize(manager: DuckDbConnectionManager, namespaces: &[String]) -> Result<Self, CacheError> {
        let connection = manager
            .acquire()
            .map_err(|error| CacheError::initialization(error.to_string()))?;
        migrations::apply_migrations(&connection)
            .and_then(|()| migrations::register_namespaces(&connection, namespaces))
            .map_err(|error| CacheError::initialization(error.to_string()))?;
        drop(connection);

        Ok(Self {
            manager,
            namespaces: Arc::new(namespaces.iter().cloned().collect()),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.manager.db_path()
    }

    fn check_namespace(&self, namespace: &str) -> Result<(), CacheError> {
        if self.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(CacheError::unknown_namespace(namespace))
        }
    }

    /// Runs `operation` on a pooled connection inside `spawn_blocking`.
    async fn with_connection<T, F>(&self, key: &str, operation: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let manager = self.manager.clone();
        let error_key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let connection = manager.acquire()?;
            operation(&connection)
        })
        .await
        .map_err(|error| CacheError::operation(error_key, format!("blocking task failed: {error}")))?
    }
}

impl KeyedStore for DuckDbStore {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn get<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, Option<StoredEntry>> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let (ns, k) = (namespace.to_string(), key.to_string());
            let row = self
                .with_connection(key, move |connection| {
                    let sql = format!(
                        "SELECT {SELECT_COLUMNS} FROM cache_entries WHERE namespace = ? AND key = ?"
                    );
                    let mut statement = connection.prepare(&sql)?;
                    let mut rows = statement.query_map(params![ns, k], read_row)?;
                    let row = rows.next().transpose()?;
                    Ok(row)
                })
                .await?;
            row.map(decode_row).transpose()
        })
    }

    fn put<'a>(&'a self, namespace: &'a str, entry: StoredEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let ns = namespace.to_string();
            let key = entry.key.clone();
            let data = serde_json::to_string(&entry.data)
                .map_err(|error| CacheError::operation(&key, error.to_string()))?;
            self.with_connection(&key, move |connection| {
                connection.execute(
                    "INSERT OR REPLACE INTO cache_entries \
                     (namespace, key, data, created_at_ms, ttl_ms, expires_at_ms, hit_count) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        ns,
                        entry.key,
                        data,
                        entry.timestamp,
                        i64::try_from(entry.ttl_ms).unwrap_or(i64::MAX),
                        entry.expires_at,
                        i64::try_from(entry.hit_count).unwrap_or(i64::MAX),
                    ],
                )?;
                Ok(())
            })
            .await
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let (ns, k) = (namespace.to_string(), key.to_string());
            self.with_connection(key, move |connection| {
                connection.execute(
                    "DELETE FROM cache_entries WHERE namespace = ? AND key = ?",
                    params![ns, k],
                )?;
                Ok(())
            })
            .await
        })
    }

    fn purge_expired<'a>(&'a self, namespace: &'a str, key: &'a str, now_ms: i64) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let (ns, k) = (namespace.to_string(), key.to_string());
            self.with_connection(key, move |connection| {
                let removed = connection.execute(
                    "DELETE FROM cache_entries WHERE namespace = ? AND key = ? AND expires_at_ms <= ?",
                    params![ns, k, now_ms],
                )?;
                Ok(removed > 0)
            })
            .await
        })
    }

    fn keys<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let ns = namespace.to_string();
            self.with_connection("*", move |connection| {
                let mut statement = connection
                    .prepare("SELECT key FROM cache_entries WHERE namespace = ? ORDER BY key")?;
                let keys = statement
                    .query_map(params![ns], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
        })
    }

    fn entries<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<StoredEntry>> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let ns = namespace.to_string();
            let rows = self
                .with_connection("*", move |connection| {
                    let sql = format!("SELECT {SELECT_COLUMNS} FROM cache_entries WHERE namespace = ?");
                    let mut statement = connection.prepare(&sql)?;
                    let rows = statement
                        .query_map(params![ns], read_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(decode_row).collect()
        })
    }

    fn clear<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let ns = namespace.to_string();
            self.with_connection("*", move |connection| {
                connection.execute("DELETE FROM cache_entries WHERE namespace = ?", params![ns])?;
                Ok(())
            })
            .await
        })
    }

    fn increment_hits<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_namespace(namespace)?;
            let (ns, k) = (namespace.to_string(), key.to_string());
            self.with_connection(key, move |connection| {
                connection.execute(
                    "UPDATE cache_entries SET hit_count = hit_count + 1 WHERE namespace = ? AND key = ?",
                    params![ns, k],
                )?;
                Ok(())
            })
            .await
        })
    }
}

fn read_row(row: &::duckdb::Row<'_>) -> Result<RawRow, ::duckdb::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_row(row: RawRow) -> Result<StoredEntry, CacheError> {
    let (key, data, timestamp, ttl_ms, expires_at, hit_count) = row;
    let data = serde_json::from_str(&data)
        .map_err(|error| CacheError::operation(&key, format!("corrupt payload: {error}")))?;
    Ok(StoredEntry {
        key,
        data,
        timestamp,
        ttl_ms: u64::try_from(ttl_ms).unwrap_or_default(),
        expires_at,
        hit_count: u64::try_from(hit_count).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::entry::CacheEntry;

    fn namespaces() -> Vec<String> {
        vec![String::from("quotes"), String::from("news")]
    }

    #[tokio::test]
    async fn round_trips_entries_through_the_table() {
        let store = DuckDbStore::open_in_memory(&namespaces()).expect("open");
        let entry = CacheEntry::new("stock:quote:AAPL", json!({"price": 189.5}), Duration::from_secs(30));

        store.put("quotes", entry.clone()).await.expect("put");
        let loaded = store
            .get("quotes", "stock:quote:AAPL")
            .await
            .expect("get")
            .expect("present");

        assert_eq!(loaded, entry);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = DuckDbStore::open_in_memory(&namespaces()).expect("open");
        store
            .put("quotes", CacheEntry::new("k", json!(1), Duration::from_secs(30)))
            .await
            .expect("put");

        assert!(store.get("news", "k").await.expect("get").is_none());
        assert_eq!(store.keys("quotes").await.expect("keys"), vec![String::from("k")]);
        assert!(store.keys("news").await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn increment_hits_is_applied_in_sql() {
        let store = DuckDbStore::open_in_memory(&namespaces()).expect("open");
        store
            .put("quotes", CacheEntry::new("k", json!(1), Duration::from_secs(30)))
            .await
            .expect("put");

        store.increment_hits("quotes", "k").await.expect("hit");
        store.increment_hits("quotes", "k").await.expect("hit");

        let entry = store.get("quotes", "k").await.expect("get").expect("present");
        assert_eq!(entry.hit_count, 2);
    }

    #[tokio::test]
    async fn purge_expired_checks_expiry_in_sql() {
        let store = DuckDbStore::open_in_memory(&namespaces()).expect("open");
        store
            .put("quotes", CacheEntry::created_at("k", json!(1), Duration::from_secs(10), 1_000))
            .await
            .expect("put");

        assert!(!store.purge_expired("quotes", "k", 10_999).await.expect("purge"));
        assert!(store.get("quotes", "k").await.expect("get").is_some());
        assert!(store.purge_expired("quotes", "k", 11_000).await.expect("purge"));
        assert!(store.get("quotes", "k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn survives_reopen_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache").join("cache.duckdb");

        {
            let store = DuckDbStore::open(&path, &namespaces(), 2).expect("open");
            store
                .put("news", CacheEntry::new("headline", json!("up"), Duration::from_secs(300)))
                .await
                .expect("put");
        }

        let reopened = DuckDbStore::open(&path, &namespaces(), 2).expect("reopen");
        let entry = reopened
            .get("news", "headline")
            .await
            .expect("get")
            .expect("persisted");
        assert_eq!(entry.data, json!("up"));
        assert_eq!(reopened.db_path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn undeclared_namespace_is_rejected_without_touching_the_db() {
        let store = DuckDbStore::open_in_memory(&namespaces()).expect("open");

        let error = store.clear("crypto").await.expect_err("crypto is undeclared");
        assert_eq!(error.code(), "cache.unknown_namespace");
    }
}
