use thiserror::Error;

/// Storage-layer failure.
///
/// Never escapes [`PersistentCacheStore`](crate::PersistentCacheStore): every
/// public read or write degrades to "absent" or a no-op and logs the error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache operation failed for key '{key}': {message}")]
    Operation { key: String, message: String },

    #[error("namespace '{namespace}' is not declared in the store configuration")]
    UnknownNamespace { namespace: String },

    #[error("cache store initialization failed: {message}")]
    Initialization { message: String },
}

impl CacheError {
    pub fn operation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn unknown_namespace(namespace: impl Into<String>) -> Self {
        Self::UnknownNamespace {
            namespace: namespace.into(),
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Key the failure relates to, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Operation { key, .. } => Some(key),
            Self::UnknownNamespace { .. } | Self::Initialization { .. } => None,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Operation { .. } => "cache.operation",
            Self::UnknownNamespace { .. } => "cache.unknown_namespace",
            Self::Initialization { .. } => "cache.initialization",
        }
    }
}

impl From<::duckdb::Error> for CacheError {
    fn from(error: ::duckdb::Error) -> Self {
        Self::operation("*", error.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        Self::operation("*", format!("serialization error: {error}"))
    }
}
