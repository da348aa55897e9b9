//! Primary/secondary request routing.
//!
//! Failures another upstream could serve (exhausted retries, rate limits,
//! transport errors, 5xx) are replayed against the secondary executor.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::FetchError;
use crate::executor::{RequestConfig, RequestExecutor};
use crate::response::NormalizedResponse;

/// Primary executor with an optional secondary path.
///
/// The secondary is tried only for failures that another upstream could
/// plausibly serve (see [`FetchError::is_fallback_eligible`]).
#[derive(Debug, Clone)]
pub struct FallbackExecutor {
    primary: RequestExecutor,
    secondary: Option<RequestExecutor>,
    fallback_enabled: bool,
}

impl FallbackExecutor {
    pub fn new(primary: RequestExecutor) -> Self {
        Self {
            primary,
            secondary: None,
            fallback_enabled: false,
        }
    }

    /// Enables fallback to `secondary`. The primary then reports
    /// `fallback_used = true` on exhaustion.
    pub fn with_secondary(mut self, secondary: RequestExecutor) -> Self {
        self.primary = self.primary.with_fallback_available(true);
        self.secondary = Some(secondary);
        self.fallback_enabled = true;
        self
    }

    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        let available = enabled && self.secondary.is_some();
        self.primary = self.primary.with_fallback_available(available);
        self
    }

    pub fn primary(&self) -> &RequestExecutor {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&RequestExecutor> {
        self.secondary.as_ref()
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled && self.secondary.is_some()
    }

    pub async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &RequestConfig,
    ) -> Result<NormalizedResponse<T>, FetchError> {
        self.execute_observed(endpoint, request, &|_attempt: u32| {})
            .await
    }

    /// Like [`execute`](Self::execute). `on_attempt` sees the attempts of
    /// both paths, each path counting from zero.
    pub async fn execute_observed<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &RequestConfig,
        on_attempt: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<NormalizedResponse<T>, FetchError> {
        let primary_error = match self.primary.execute_observed(endpoint, request, on_attempt).await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        let Some(secondary) = self.secondary.as_ref().filter(|_| self.fallback_enabled) else {
            return Err(primary_error);
        };
        if !primary_error.is_fallback_eligible() {
            return Err(primary_error);
        }

        warn!(
            primary = %self.primary.source(),
            secondary = %secondary.source(),
            error = %primary_error,
            "primary source failed; trying fallback"
        );

        secondary
            .execute_observed(endpoint, request, on_attempt)
            .await
            .map_err(|error| match error {
                FetchError::DataFetch {
                    source_id,
                    attempts,
                    last,
                    ..
                } => FetchError::DataFetch {
                    source_id,
                    fallback_used: true,
                    attempts,
                    last,
                },
                other => other,
            })
    }
}
