//! # Ferrofetch Core
//!
//! Resilient request execution and cache-aside orchestration.
//!
//! ## Overview
//!
//! - **Request executor** with timeouts, retries, constant or exponential
//!   backoff and 429 detection
//! - **Typed errors** that decide whether an attempt is retried
//! - **Cache orchestrator** implementing `get_or_fetch` over a
//!   [`PersistentCacheStore`] namespace, with single-flight coalescing
//! - **Fallback chaining** to a secondary upstream
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Per-upstream executor configuration |
//! | [`error`] | `FetchError` taxonomy and the `Retryable` trait |
//! | [`executor`] | `RequestExecutor` and `RequestConfig` |
//! | [`fallback`] | Primary/secondary executor chaining |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`orchestrator`] | Cache-aside orchestration |
//! | [`response`] | `NormalizedResponse` and `RateLimitInfo` |
//! | [`retry`] | Backoff schedules and the generic retry loop |
//! | [`service`] | `CachedSource` and its flow states |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ferrofetch_core::{CacheOrchestrator, ExecutorConfig, RequestConfig, RequestExecutor};
//! use ferrofetch_store::{PersistentCacheStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(PersistentCacheStore::new(StoreConfig::default()));
//!     let quotes = CacheOrchestrator::new("quotes", store);
//!     let executor = RequestExecutor::new(ExecutorConfig::new("proxy", "https://api.example.com"));
//!
//!     let quote = quotes
//!         .get_or_fetch(
//!             "stock:quote:AAPL",
//!             move || async move {
//!                 let request = RequestConfig::new().with_query("symbol", "AAPL");
//!                 executor
//!                     .execute::<serde_json::Value>("quote", &request)
//!                     .await
//!                     .map(|response| response.data)
//!             },
//!             Duration::from_secs(30),
//!         )
//!         .await?;
//!
//!     println!("cached={} data={}", quote.cached, quote.data);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Domain service     │
//! └──────────┬──────────┘
//!            │ get_or_fetch
//!            ▼
//! ┌─────────────────────┐     ┌──────────────────────┐
//! │ Cache Orchestrator  │────▶│ PersistentCacheStore │
//! └──────────┬──────────┘     └──────────────────────┘
//!            │ miss
//!            ▼
//! ┌─────────────────────┐     ┌──────────────────────┐
//! │ Request Executor    │────▶│ HttpClient (reqwest) │
//! └─────────────────────┘     └──────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod http_client;
pub mod orchestrator;
pub mod response;
pub mod retry;
pub mod service;

pub use config::{ExecutorConfig, API_KEY_HEADER, DEFAULT_ENV_PREFIX};
pub use error::{CacheError, FetchError, Retryable};
pub use executor::{RequestConfig, RequestExecutor};
pub use fallback::FallbackExecutor;
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpFuture, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient,
};
pub use orchestrator::{
    CacheMode, CacheOrchestrator, CacheWriteEvent, Cached, Coalescing, KeyPattern,
    OrchestratorStats, WarmEntry, WriteOutcome,
};
pub use response::{NormalizedResponse, RateLimitInfo, DEFAULT_RATE_LIMIT_WINDOW_SECS};
pub use retry::{Backoff, RetryFailure, RetryPolicy};
pub use service::{CachedSource, FlowState, FlowTrace, Traced};

pub use ferrofetch_store::{PersistentCacheStore, StoreBackend, StoreConfig, StoreStats};
