use std::env;
use std::path::PathBuf;

/// Namespaces declared when no explicit set is configured.
pub const DEFAULT_NAMESPACES: &[&str] = &["quotes", "crypto", "news", "metadata"];

/// Backing engine for the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local map, lost on exit.
    Memory,
    /// `DuckDB` database file.
    DuckDb { path: PathBuf },
}

/// Configuration for [`PersistentCacheStore`](crate::PersistentCacheStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Fixed set of namespaces created at initialization.
    pub namespaces: Vec<String>,
    /// Maximum idle `DuckDB` connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::DuckDb {
                path: default_db_path(),
            },
            namespaces: default_namespaces(),
            max_pool_size: 4,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ..Self::default()
        }
    }

    pub fn duckdb(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StoreBackend::DuckDb { path: path.into() },
            ..Self::default()
        }
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }
}

pub fn default_namespaces() -> Vec<String> {
    DEFAULT_NAMESPACES.iter().map(|ns| (*ns).to_string()).collect()
}

/// `$FERROFETCH_HOME`, else `$HOME/.ferrofetch`, else `./.ferrofetch`.
pub fn resolve_ferrofetch_home() -> PathBuf {
    if let Some(path) = env::var_os("FERROFETCH_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ferrofetch");
    }

    PathBuf::from(".ferrofetch")
}

pub fn default_db_path() -> PathBuf {
    resolve_ferrofetch_home().join("cache").join("cache.duckdb")
}
