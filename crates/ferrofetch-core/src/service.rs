//! Cached data service: one call from cache lookup to upstream fetch.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::executor::RequestConfig;
use crate::fallback::FallbackExecutor;
use crate::orchestrator::{CacheMode, CacheOrchestrator};
use crate::response::NormalizedResponse;

/// Lifecycle of one cached call.
///
/// Calls that skip the lookup ([`CacheMode::Refresh`], [`CacheMode::Bypass`])
/// go straight from `Cold` to `Fetching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    Cold,
    CacheLookup,
    CacheHit,
    CacheMiss,
    Fetching,
    FetchRetry,
    FetchSuccess,
    CacheWrite,
    Done,
    FetchExhausted,
    Failed,
}

impl FlowState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::CacheLookup => "cache_lookup",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::Fetching => "fetching",
            Self::FetchRetry => "fetch_retry",
            Self::FetchSuccess => "fetch_success",
            Self::CacheWrite => "cache_write",
            Self::Done => "done",
            Self::FetchExhausted => "fetch_exhausted",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CacheHit | Self::Done | Self::Failed)
    }

    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;

        matches!(
            (self, next),
            (Cold, CacheLookup | Fetching)
                | (CacheLookup, CacheHit | CacheMiss)
                | (CacheMiss, Fetching)
                | (Fetching, FetchRetry | FetchSuccess | FetchExhausted | Failed)
                | (FetchRetry, Fetching)
                | (FetchSuccess, CacheWrite | Done)
                | (CacheWrite, Done)
                | (FetchExhausted, Failed)
        )
    }
}

impl Display for FlowState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States visited by one call, in order. Starts at [`FlowState::Cold`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTrace {
    key: String,
    states: Vec<FlowState>,
}

impl FlowTrace {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            states: vec![FlowState::Cold],
        }
    }

    pub fn current(&self) -> FlowState {
        self.states.last().copied().unwrap_or(FlowState::Cold)
    }

    pub fn states(&self) -> &[FlowState] {
        &self.states
    }

    /// Moves to `next`. Invalid transitions are logged and ignored.
    pub fn advance(&mut self, next: FlowState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(key = %self.key, from = %current, to = %next, "ignoring invalid flow transition");
            return;
        }
        debug!(key = %self.key, from = %current, to = %next, "flow transition");
        self.states.push(next);
    }

    fn record_failure(&mut self, error: &FetchError) {
        if matches!(error, FetchError::DataFetch { .. }) {
            self.advance(FlowState::FetchExhausted);
        }
        self.advance(FlowState::Failed);
    }
}

/// Result of [`CachedSource::fetch_traced`].
#[derive(Debug)]
pub struct Traced<T> {
    pub result: Result<NormalizedResponse<T>, FetchError>,
    pub trace: FlowTrace,
}

/// Serves one upstream through the cache.
///
/// Successful responses are cached whole, so a hit reports the source that
/// originally served the data with `cached = true`.
#[derive(Clone)]
pub struct CachedSource {
    executor: FallbackExecutor,
    orchestrator: CacheOrchestrator,
}

impl CachedSource {
    pub fn new(executor: FallbackExecutor, orchestrator: CacheOrchestrator) -> Self {
        Self {
            executor,
            orchestrator,
        }
    }

    pub fn executor(&self) -> &FallbackExecutor {
        &self.executor
    }

    pub fn orchestrator(&self) -> &CacheOrchestrator {
        &self.orchestrator
    }

    pub async fn fetch<T>(
        &self,
        key: &str,
        endpoint: &str,
        request: &RequestConfig,
        ttl: Duration,
        mode: CacheMode,
    ) -> Result<NormalizedResponse<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.fetch_traced(key, endpoint, request, ttl, mode)
            .await
            .result
    }

    pub async fn fetch_traced<T>(
        &self,
        key: &str,
        endpoint: &str,
        request: &RequestConfig,
        ttl: Duration,
        mode: CacheMode,
    ) -> Traced<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let trace = Arc::new(Mutex::new(FlowTrace::new(key)));
        let looks_up = mode == CacheMode::Use;
        if looks_up {
            advance(&trace, FlowState::CacheLookup);
        }

        let fetch_fn = {
            let executor = self.executor.clone();
            let endpoint = endpoint.to_string();
            let request = request.clone();
            let trace = Arc::clone(&trace);
            move || async move {
                if looks_up {
                    advance(&trace, FlowState::CacheMiss);
                }
                advance(&trace, FlowState::Fetching);
                let attempts = AtomicU32::new(0);
                let on_attempt = |_attempt: u32| {
                    if attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                        advance(&trace, FlowState::FetchRetry);
                        advance(&trace, FlowState::Fetching);
                    }
                };
                let result = executor
                    .execute_observed::<T>(&endpoint, &request, &on_attempt)
                    .await;
                match &result {
                    Ok(_) => advance(&trace, FlowState::FetchSuccess),
                    Err(error) => trace
                        .lock()
                        .expect("flow trace poisoned")
                        .record_failure(error),
                }
                result
            }
        };

        let result = self
            .orchestrator
            .get_or_fetch_with_mode(key, fetch_fn, ttl, mode)
            .await;

        let mut trace = trace.lock().expect("flow trace poisoned").clone();
        if matches!(trace.current(), FlowState::Cold | FlowState::CacheLookup) {
            // Served without running our fetch: a hit or a joined in-flight fetch.
            match &result {
                Ok(cached) if cached.cached => trace.advance(FlowState::CacheHit),
                Ok(_) => {
                    if looks_up {
                        trace.advance(FlowState::CacheMiss);
                    }
                    trace.advance(FlowState::Fetching);
                    trace.advance(FlowState::FetchSuccess);
                }
                Err(error) => {
                    if looks_up {
                        trace.advance(FlowState::CacheMiss);
                    }
                    trace.advance(FlowState::Fetching);
                    trace.record_failure(error);
                }
            }
        }
        if trace.current() == FlowState::FetchSuccess {
            if mode != CacheMode::Bypass {
                trace.advance(FlowState::CacheWrite);
            }
            trace.advance(FlowState::Done);
        }

        let result = result.map(|cached| {
            let was_cached = cached.cached;
            cached.data.with_cached(was_cached)
        });
        Traced { result, trace }
    }
}

fn advance(trace: &Mutex<FlowTrace>, next: FlowState) {
    trace.lock().expect("flow trace poisoned").advance(next);
}
