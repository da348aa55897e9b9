//! # Ferrofetch Store
//!
//! Namespaced, TTL-governed cache store used by the ferrofetch cache-aside layer.
//!
//! ## Overview
//!
//! - **Namespaces** are declared once in [`StoreConfig`] (`quotes`, `crypto`,
//!   `news`, `metadata` by default) and never discovered at runtime.
//! - **Lazy expiration**: an entry is checked against its `expires_at` on read
//!   and purged by that read. There is no background sweeper.
//! - **Degrading failures**: storage errors are logged and turned into
//!   "absent" / no-op results; they never reach the caller.
//! - **Pluggable backends** behind [`KeyedStore`]: [`MemoryStore`] and the
//!   `DuckDB`-file-backed [`DuckDbStore`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ferrofetch_store::{PersistentCacheStore, StoreConfig};
//!
//! # async fn demo() {
//! let store = PersistentCacheStore::new(StoreConfig::in_memory());
//! store.set("quotes", "stock:quote:AAPL", &189.5_f64, Duration::from_secs(30)).await;
//! let price: Option<f64> = store.get("quotes", "stock:quote:AAPL").await;
//! assert_eq!(price, Some(189.5));
//! # }
//! ```
//!
//! ## Tables (`DuckDB` backend)
//!
//! | Table | Description |
//! |-------|-------------|
//! | `cache_entries` | One row per `(namespace, key)` with JSON payload and expiry |
//! | `cache_namespaces` | Declared namespaces |
//! | `schema_migrations` | Applied migration versions |

pub mod backend;
pub mod config;
pub mod duckdb;
pub mod duckdb_store;
pub mod entry;
pub mod error;
pub mod memory;
pub mod migrations;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub use backend::{KeyedStore, StoreFuture};
pub use config::{
    default_db_path, default_namespaces, resolve_ferrofetch_home, StoreBackend, StoreConfig,
    DEFAULT_NAMESPACES,
};
pub use duckdb_store::DuckDbStore;
pub use entry::{now_ms, CacheEntry, StoreStats, StoredEntry};
pub use error::CacheError;
pub use memory::MemoryStore;

pub type OpenFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn KeyedStore>, CacheError>> + Send>>;

/// Factory producing the backend handle for a set of namespaces.
pub type StoreOpener = Arc<dyn Fn(Vec<String>) -> OpenFuture + Send + Sync>;

/// Namespaced cache store with lazy expiration and hit accounting.
///
/// The backend handle is opened on first use. Concurrent first callers share a
/// single in-flight initialization, so exactly one handle is ever created.
pub struct PersistentCacheStore {
    namespaces: Vec<String>,
    opener: StoreOpener,
    handle: OnceCell<Arc<dyn KeyedStore>>,
}

impl PersistentCacheStore {
    pub fn new(config: StoreConfig) -> Self {
        let StoreConfig {
            backend,
            namespaces,
            max_pool_size,
        } = config;

        let opener: StoreOpener = match backend {
            StoreBackend::Memory => Arc::new(|namespaces: Vec<String>| -> OpenFuture {
                Box::pin(async move {
                    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new(namespaces));
                    Ok(store)
                })
            }),
            StoreBackend::DuckDb { path } => Arc::new(move |namespaces: Vec<String>| -> OpenFuture {
                let path = path.clone();
                Box::pin(async move {
                    let store = tokio::task::spawn_blocking(move || {
                        DuckDbStore::open(&path, &namespaces, max_pool_size)
                    })
                    .await
                    .map_err(|error| CacheError::initialization(error.to_string()))??;
                    let store: Arc<dyn KeyedStore> = Arc::new(store);
                    Ok(store)
                })
            }),
        };

        Self::with_opener(namespaces, opener)
    }

    /// Builds a store whose backend is produced lazily by `opener`.
    pub fn with_opener(namespaces: Vec<String>, opener: StoreOpener) -> Self {
        Self {
            namespaces,
            opener,
            handle: OnceCell::new(),
        }
    }

    /// Wraps an already-open backend.
    pub fn with_backend(namespaces: Vec<String>, backend: Arc<dyn KeyedStore>) -> Self {
        let ready = Arc::clone(&backend);
        Self {
            namespaces,
            opener: Arc::new(move |_: Vec<String>| -> OpenFuture {
                let backend = Arc::clone(&ready);
                Box::pin(async move { Ok(backend) })
            }),
            handle: OnceCell::new_with(Some(backend)),
        }
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    async fn handle(&self) -> Result<Arc<dyn KeyedStore>, CacheError> {
        let handle = self
            .handle
            .get_or_try_init(|| {
                debug!(namespaces = ?self.namespaces, "opening cache store");
                (self.opener)(self.namespaces.clone())
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Returns the live payload stored under `key`, or `None`.
    ///
    /// An expired entry is reported as absent and purged, unless a concurrent
    /// `set` has already replaced it with a live one.
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        self.get_entry(namespace, key).await.map(|entry| entry.data)
    }

    /// Like [`get`](Self::get) but returns the whole entry.
    ///
    /// The returned `hit_count` does not include this read: the increment is
    /// issued in the background after the entry has been loaded.
    pub async fn get_entry<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<CacheEntry<T>> {
        match self.try_get_entry(namespace, key).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(namespace, key, %error, "cache read failed; treating as absent");
                None
            }
        }
    }

    async fn try_get_entry<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<CacheEntry<T>>, CacheError> {
        let backend = self.handle().await?;
        let Some(entry) = backend.get(namespace, key).await? else {
            return Ok(None);
        };

        let now = now_ms();
        if entry.is_expired_at(now) {
            debug!(namespace, key, expires_at = entry.expires_at, "purging expired cache entry");
            if let Err(error) = backend.purge_expired(namespace, key, now).await {
                warn!(namespace, key, %error, "failed to purge expired cache entry");
            }
            return Ok(None);
        }

        let entry = match serde_json::from_value::<T>(entry.data.clone()) {
            Ok(data) => entry.map(|_| data),
            Err(error) => {
                warn!(namespace, key, %error, "cached payload does not match requested type");
                return Ok(None);
            }
        };

        let (ns, k) = (namespace.to_string(), key.to_string());
        tokio::spawn(async move {
            if let Err(error) = backend.increment_hits(&ns, &k).await {
                debug!(namespace = %ns, key = %k, %error, "hit count update dropped");
            }
        });

        Ok(Some(entry))
    }

    /// Stores `data` under `key`, replacing any existing entry.
    ///
    /// Failures are logged and swallowed.
    pub async fn set<T: Serialize + ?Sized>(&self, namespace: &str, key: &str, data: &T, ttl: Duration) {
        if let Err(error) = self.try_set(namespace, key, data, ttl).await {
            warn!(namespace, key, %error, "cache write failed; continuing without cache");
        }
    }

    /// Fallible variant of [`set`](Self::set) for callers that observe write outcomes.
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        data: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(data).map_err(|error| CacheError::operation(key, error.to_string()))?;
        let backend = self.handle().await?;
        backend.put(namespace, CacheEntry::new(key, value, ttl)).await
    }

    pub async fn delete(&self, namespace: &str, key: &str) {
        let result = match self.handle().await {
            Ok(backend) => backend.delete(namespace, key).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            warn!(namespace, key, %error, "cache delete failed");
        }
    }

    pub async fn clear(&self, namespace: &str) {
        let result = match self.handle().await {
            Ok(backend) => backend.clear(namespace).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            warn!(namespace, %error, "cache clear failed");
        }
    }

    /// Clears every declared namespace.
    pub async fn clear_all(&self) {
        for namespace in &self.namespaces {
            self.clear(namespace).await;
        }
    }

    pub async fn get_all_keys(&self, namespace: &str) -> Vec<String> {
        let result = match self.handle().await {
            Ok(backend) => backend.keys(namespace).await,
            Err(error) => Err(error),
        };
        result.unwrap_or_else(|error| {
            warn!(namespace, %error, "cache key listing failed");
            Vec::new()
        })
    }

    pub async fn get_stats(&self, namespace: &str) -> StoreStats {
        let result = match self.handle().await {
            Ok(backend) => backend.entries(namespace).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(entries) => StoreStats::from_entries(&entries, now_ms()),
            Err(error) => {
                warn!(namespace, %error, "cache stats unavailable");
                StoreStats::default()
            }
        }
    }
}
