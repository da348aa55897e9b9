//! Typed failure categories for request execution and cache-aside flows.
//!
//! The variant decides what happens next:
//!
//! | Variant | Retried by the executor | Typical caller reaction |
//! |---------|-------------------------|-------------------------|
//! | [`FetchError::Transport`] | yes | none, surfaces as `DataFetch` once exhausted |
//! | [`FetchError::Fetch`] | yes | none, raised by caller-supplied fetch functions |
//! | [`FetchError::ApiCall`] | only statuses listed in `retry_on_status` | branch on `status` |
//! | [`FetchError::RateLimit`] | never | wait until `reset_time_ms` or use a fallback |
//! | [`FetchError::Decode`] | never | report |
//! | [`FetchError::DataFetch`] | terminal | use the fallback path if `fallback_used` |
//! | [`FetchError::Cache`] | n/a | never surfaced by the store itself |

use thiserror::Error;

pub use ferrofetch_store::CacheError;

use crate::response::RateLimitInfo;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// A completed response with a non-2xx, non-429 status.
    #[error("{source_id} returned HTTP {status}: {message}")]
    ApiCall {
        code: String,
        status: u16,
        source_id: String,
        message: String,
    },

    /// HTTP 429. `reset_time_ms` is the epoch-millisecond instant the provider
    /// asked callers to wait for.
    #[error("{source_id} rate limit exceeded; resets at {reset_time_ms} ms")]
    RateLimit {
        source_id: String,
        reset_time_ms: i64,
        info: RateLimitInfo,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Terminal failure after the retry budget was spent.
    #[error("{source_id} failed after {attempts} attempt(s) (fallback available: {fallback_used})")]
    DataFetch {
        source_id: String,
        fallback_used: bool,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    /// Connection, DNS, timeout or body-read failure.
    #[error("{source_id} transport error: {message}")]
    Transport {
        source_id: String,
        message: String,
        timed_out: bool,
    },

    #[error("{source_id} returned an undecodable body: {message}")]
    Decode { source_id: String, message: String },

    /// Failure raised by a caller-supplied fetch function.
    #[error("fetch failed: {message}")]
    Fetch { message: String },
}

/// Classifies errors for the retry loop.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Fetch { .. })
    }
}

impl FetchError {
    pub fn api_call(status: u16, source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ApiCall {
            code: format!("api.http_{status}"),
            status,
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn rate_limit(info: RateLimitInfo) -> Self {
        Self::RateLimit {
            source_id: info.source.clone(),
            reset_time_ms: info.reset,
            info,
        }
    }

    pub fn transport(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            source_id: source_id.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(source_id: impl Into<String>, timeout_ms: u128) -> Self {
        Self::Transport {
            source_id: source_id.into(),
            message: format!("request timed out after {timeout_ms}ms"),
            timed_out: true,
        }
    }

    pub fn decode(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
        }
    }

    pub fn data_fetch(
        source_id: impl Into<String>,
        fallback_used: bool,
        attempts: u32,
        last: FetchError,
    ) -> Self {
        Self::DataFetch {
            source_id: source_id.into(),
            fallback_used,
            attempts,
            last: Box::new(last),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::ApiCall { code, .. } => code,
            Self::RateLimit { .. } => "api.rate_limited",
            Self::Cache(error) => error.code(),
            Self::DataFetch { .. } => "fetch.exhausted",
            Self::Transport { timed_out: true, .. } => "transport.timeout",
            Self::Transport { .. } => "transport.failed",
            Self::Decode { .. } => "response.decode",
            Self::Fetch { .. } => "fetch.failed",
        }
    }

    /// HTTP status for completed responses (`ApiCall` and `RateLimit`).
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiCall { status, .. } => Some(*status),
            Self::RateLimit { .. } => Some(429),
            Self::DataFetch { last, .. } => last.status(),
            _ => None,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::ApiCall { source_id, .. }
            | Self::RateLimit { source_id, .. }
            | Self::DataFetch { source_id, .. }
            | Self::Transport { source_id, .. }
            | Self::Decode { source_id, .. } => Some(source_id),
            Self::Cache(_) | Self::Fetch { .. } => None,
        }
    }

    pub fn rate_limit_reset_ms(&self) -> Option<i64> {
        match self {
            Self::RateLimit { reset_time_ms, .. } => Some(*reset_time_ms),
            _ => None,
        }
    }

    /// Whether a secondary data path should be tried after this failure.
    ///
    /// Client errors (4xx other than 429) and undecodable bodies would fail the
    /// same way on any path and are not re-routed.
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            Self::DataFetch { .. } | Self::RateLimit { .. } | Self::Transport { .. } => true,
            Self::ApiCall { status, .. } => *status >= 500,
            Self::Cache(_) | Self::Decode { .. } | Self::Fetch { .. } => false,
        }
    }
}
