use std::collections::BTreeMap;

use ferrofetch_store::now_ms;
use serde::{Deserialize, Serialize};

/// Seconds to wait when a 429 carries no usable `X-RateLimit-Reset` header.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: i64 = 60;

/// Throttling details reported by a provider alongside HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Epoch milliseconds at which the budget resets.
    pub reset: i64,
    pub source: String,
}

impl RateLimitInfo {
    /// Reads `x-ratelimit-*` headers (names already lower-cased).
    ///
    /// `x-ratelimit-reset` is epoch seconds and is converted to milliseconds.
    pub fn from_headers(source: impl Into<String>, headers: &BTreeMap<String, String>) -> Self {
        let parse_u64 = |name: &str| headers.get(name).and_then(|value| value.trim().parse::<u64>().ok());
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map_or_else(
                || now_ms().saturating_add(DEFAULT_RATE_LIMIT_WINDOW_SECS * 1_000),
                |seconds| seconds.saturating_mul(1_000),
            );

        Self {
            limit: parse_u64("x-ratelimit-limit"),
            remaining: parse_u64("x-ratelimit-remaining"),
            reset,
            source: source.into(),
        }
    }

    /// Milliseconds until the reset instant, zero if it already passed.
    pub fn wait_ms(&self) -> u64 {
        u64::try_from(self.reset.saturating_sub(now_ms())).unwrap_or(0)
    }
}

/// Uniform result shape returned to domain services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse<T> {
    pub data: T,
    pub success: bool,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub source: String,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> NormalizedResponse<T> {
    pub fn ok(data: T, source: impl Into<String>) -> Self {
        Self {
            data,
            success: true,
            timestamp: now_ms(),
            source: source.into(),
            cached: false,
            error: None,
        }
    }

    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }
}
