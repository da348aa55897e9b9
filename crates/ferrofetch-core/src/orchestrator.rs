//! Cache-aside orchestration over one store namespace.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ferrofetch_store::{PersistentCacheStore, StoreStats};
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;

const WRITE_EVENT_CAPACITY: usize = 64;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// Defines how a call interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Read a live entry if present; otherwise fetch and write back.
    #[default]
    Use,
    /// Skip the lookup, fetch, and write the fresh result.
    Refresh,
    /// Fetch without reading or writing the cache.
    Bypass,
}

/// How concurrent misses on one key are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coalescing {
    /// Concurrent misses share one upstream call.
    #[default]
    SingleFlight,
    /// Every miss invokes its own fetch function.
    Independent,
}

/// Value returned by [`CacheOrchestrator::get_or_fetch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cached<T> {
    pub data: T,
    /// `true` when served from the cache without fetching.
    pub cached: bool,
}

/// Key selector for [`CacheOrchestrator::invalidate_pattern`].
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Prefix(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(key),
        }
    }
}

/// One preload item for [`CacheOrchestrator::warm_cache`].
#[derive(Debug, Clone, PartialEq)]
pub struct WarmEntry<T> {
    pub key: String,
    pub data: T,
    pub ttl: Duration,
}

impl<T> WarmEntry<T> {
    pub fn new(key: impl Into<String>, data: T, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            data,
            ttl,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub hits: u64,
    pub misses: u64,
    /// Upstream fetch invocations.
    pub fetches: u64,
    /// Misses served by another caller's in-flight fetch.
    pub coalesced: u64,
    pub in_flight: usize,
    pub store: StoreStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    Failed(String),
}

/// Completion report for a background cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWriteEvent {
    pub key: String,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    flights: AtomicU64,
}

/// A background write that has not reached the store yet.
struct PendingWrite {
    id: u64,
    value: Value,
    /// `None` when the TTL does not fit the clock.
    expires_at: Option<Instant>,
}

impl PendingWrite {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > Instant::now())
    }
}

/// How a background write found its pending slot once the store call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Current,
    Superseded,
    /// Removed by an invalidation while the write was running.
    Invalidated,
}

/// Background writer shared by the orchestrator and its in-flight fetches.
///
/// Values handed to [`spawn`](Self::spawn) are readable through
/// [`pending_value`](Self::pending_value) until the store write settles, so a
/// read issued right after a miss never goes back upstream.
#[derive(Clone)]
struct WriteBack {
    namespace: Arc<str>,
    store: Arc<PersistentCacheStore>,
    events: broadcast::Sender<CacheWriteEvent>,
    pending: Arc<Mutex<HashMap<String, PendingWrite>>>,
    next_id: Arc<AtomicU64>,
}

impl WriteBack {
    fn new(namespace: Arc<str>, store: Arc<PersistentCacheStore>) -> Self {
        let (events, _) = broadcast::channel(WRITE_EVENT_CAPACITY);
        Self {
            namespace,
            store,
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn write(&self, key: String, value: Value, ttl: Duration) -> WriteOutcome {
        let outcome = self.persist(&key, &value, ttl).await;
        self.publish(key, outcome.clone());
        outcome
    }

    async fn persist(&self, key: &str, value: &Value, ttl: Duration) -> WriteOutcome {
        match self.store.try_set(&self.namespace, key, value, ttl).await {
            Ok(()) => WriteOutcome::Stored,
            Err(error) => {
                warn!(namespace = %self.namespace, key, %error, "cache write failed");
                WriteOutcome::Failed(error.to_string())
            }
        }
    }

    fn publish(&self, key: String, outcome: WriteOutcome) {
        let _ = self.events.send(CacheWriteEvent { key, outcome });
    }

    fn spawn(&self, key: String, value: Value, ttl: Duration) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().expect("pending writes poisoned").insert(
            key.clone(),
            PendingWrite {
                id,
                value: value.clone(),
                expires_at: Instant::now().checked_add(ttl),
            },
        );

        let writer = self.clone();
        tokio::spawn(async move {
            let outcome = writer.persist(&key, &value, ttl).await;
            if writer.settle(&key, id) == Settled::Invalidated && outcome == WriteOutcome::Stored {
                debug!(namespace = %writer.namespace, key = %key, "dropping write invalidated mid-flight");
                writer.store.delete(&writer.namespace, &key).await;
            }
            writer.publish(key, outcome);
        });
    }

    fn settle(&self, key: &str, id: u64) -> Settled {
        let mut pending = self.pending.lock().expect("pending writes poisoned");
        match pending.get(key) {
            Some(write) if write.id == id => {
                pending.remove(key);
                Settled::Current
            }
            Some(_) => Settled::Superseded,
            None => Settled::Invalidated,
        }
    }

    fn pending_value(&self, key: &str) -> Option<Value> {
        let pending = self.pending.lock().expect("pending writes poisoned");
        pending
            .get(key)
            .filter(|write| write.is_live())
            .map(|write| write.value.clone())
    }

    /// Drops pending writes whose key matches; returns the dropped keys.
    fn forget(&self, matches: impl Fn(&str) -> bool) -> Vec<String> {
        let mut pending = self.pending.lock().expect("pending writes poisoned");
        let keys = pending
            .keys()
            .filter(|key| matches(key.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for key in &keys {
            pending.remove(key);
        }
        keys
    }
}

/// One upstream call shared by every concurrent miss on a key.
struct Flight {
    id: u64,
    fetch: SharedFetch,
}

/// Removes a flight from the in-flight map when its task ends, panics included.
struct FlightGuard {
    in_flight: Arc<Mutex<HashMap<String, Flight>>>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&self.key).is_some_and(|flight| flight.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Cache-aside front for one namespace of a [`PersistentCacheStore`].
///
/// Cloning is cheap and clones share counters and the in-flight map.
#[derive(Clone)]
pub struct CacheOrchestrator {
    writer: WriteBack,
    coalescing: Coalescing,
    in_flight: Arc<Mutex<HashMap<String, Flight>>>,
    counters: Arc<Counters>,
}

impl CacheOrchestrator {
    pub fn new(namespace: impl Into<String>, store: Arc<PersistentCacheStore>) -> Self {
        Self {
            writer: WriteBack::new(Arc::from(namespace.into()), store),
            coalescing: Coalescing::default(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_coalescing(mut self, coalescing: Coalescing) -> Self {
        self.coalescing = coalescing;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.writer.namespace
    }

    pub fn store(&self) -> &Arc<PersistentCacheStore> {
        &self.writer.store
    }

    pub fn coalescing(&self) -> Coalescing {
        self.coalescing
    }

    /// Returns the live entry for `key`, or runs `fetch_fn` and stores its
    /// result in the background.
    ///
    /// Fetch errors are returned unchanged and nothing is cached. A failed
    /// cache write never fails the call. The fetched value is visible to the
    /// next lookup as soon as this call returns, even while the store write
    /// is still running.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, fetch_fn: F, ttl: Duration) -> Result<Cached<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.get_or_fetch_with_mode(key, fetch_fn, ttl, CacheMode::Use)
            .await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch) with an explicit [`CacheMode`].
    ///
    /// In single-flight mode the upstream call runs on its own task: a caller
    /// that is cancelled or times out does not cancel it, and its result is
    /// still cached. A panicking `fetch_fn` fails the waiting callers with
    /// [`FetchError::Fetch`] and leaves the key free for the next miss.
    pub async fn get_or_fetch_with_mode<T, F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        ttl: Duration,
        mode: CacheMode,
    ) -> Result<Cached<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if mode == CacheMode::Use {
            if let Some(data) = self.lookup::<T>(key).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(namespace = self.namespace(), key, "cache hit");
                return Ok(Cached { data, cached: true });
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(namespace = self.namespace(), key, "cache miss");
        }

        let write = mode != CacheMode::Bypass;
        if mode == CacheMode::Bypass || self.coalescing == Coalescing::Independent {
            self.counters.fetches.fetch_add(1, Ordering::Relaxed);
            let data = fetch_fn().await?;
            if write {
                match serde_json::to_value(&data) {
                    Ok(value) => self.writer.spawn(key.to_string(), value, ttl),
                    Err(error) => warn!(namespace = self.namespace(), key, %error, "result not cacheable"),
                }
            }
            return Ok(Cached { data, cached: false });
        }

        let value = self.single_flight(key, fetch_fn, ttl).await?;
        let data = serde_json::from_value::<T>(value)
            .map_err(|error| FetchError::decode(self.namespace(), error.to_string()))?;
        Ok(Cached { data, cached: false })
    }

    /// Pending background writes first, then the store.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(value) = self.writer.pending_value(key) {
            match serde_json::from_value::<T>(value) {
                Ok(data) => return Some(data),
                Err(error) => debug!(namespace = self.namespace(), key, %error, "pending value does not match requested type"),
            }
        }
        self.writer.store.get::<T>(self.namespace(), key).await
    }

    async fn single_flight<T, F, Fut>(&self, key: &str, fetch_fn: F, ttl: Duration) -> Result<Value, FetchError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fetch = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            let running = in_flight
                .get(key)
                .filter(|flight| flight.fetch.peek().is_none())
                .map(|flight| flight.fetch.clone());
            if let Some(fetch) = running {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(namespace = self.namespace(), key, "joining in-flight fetch");
                fetch
            } else {
                let id = self.counters.flights.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = oneshot::channel::<Result<Value, FetchError>>();
                let fetch = receiver
                    .map(|received| {
                        received.unwrap_or_else(|_| Err(FetchError::fetch("fetch task ended without a result")))
                    })
                    .boxed()
                    .shared();
                in_flight.insert(
                    key.to_string(),
                    Flight {
                        id,
                        fetch: fetch.clone(),
                    },
                );
                self.spawn_leader(id, key.to_string(), fetch_fn, ttl, sender);
                fetch
            }
        };

        fetch.await
    }

    fn spawn_leader<T, F, Fut>(
        &self,
        id: u64,
        key: String,
        fetch_fn: F,
        ttl: Duration,
        sender: oneshot::Sender<Result<Value, FetchError>>,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let writer = self.writer.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            let guard = FlightGuard {
                in_flight,
                key: key.clone(),
                id,
            };
            counters.fetches.fetch_add(1, Ordering::Relaxed);
            let result = match fetch_fn().await {
                Ok(data) => serde_json::to_value(&data)
                    .map_err(|error| FetchError::decode(&*writer.namespace, error.to_string())),
                Err(error) => Err(error),
            };

            if let Ok(value) = &result {
                writer.spawn(key, value.clone(), ttl);
            }
            drop(guard);
            let _ = sender.send(result);
        });
    }

    pub async fn invalidate(&self, key: &str) {
        debug!(namespace = self.namespace(), key, "invalidating key");
        self.writer.forget(|pending| pending == key);
        self.writer.store.delete(self.namespace(), key).await;
    }

    /// Removes every key in the namespace matching `pattern`.
    ///
    /// Scans all keys of the namespace. Returns how many were removed.
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut removed = self.writer.forget(|key| pattern.matches(key));
        let keys = self.writer.store.get_all_keys(self.namespace()).await;
        for key in keys.into_iter().filter(|key| pattern.matches(key)) {
            self.writer.store.delete(self.namespace(), &key).await;
            if !removed.contains(&key) {
                removed.push(key);
            }
        }
        debug!(namespace = self.namespace(), removed = removed.len(), "pattern invalidation");
        removed.len()
    }

    /// Preloads entries in parallel without fetching. Returns how many were stored.
    pub async fn warm_cache<T: Serialize>(&self, entries: Vec<WarmEntry<T>>) -> usize {
        let writes = entries.into_iter().filter_map(|entry| {
            match serde_json::to_value(&entry.data) {
                Ok(value) => Some(self.writer.write(entry.key, value, entry.ttl)),
                Err(error) => {
                    warn!(namespace = self.namespace(), key = %entry.key, %error, "warm entry not cacheable");
                    None
                }
            }
        });

        join_all(writes)
            .await
            .into_iter()
            .filter(|outcome| *outcome == WriteOutcome::Stored)
            .count()
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let in_flight = self.in_flight.lock().expect("in-flight map poisoned").len();
        OrchestratorStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            in_flight,
            store: self.writer.store.get_stats(self.namespace()).await,
        }
    }

    /// Completion events for background writes, warm-ups included.
    pub fn subscribe_writes(&self) -> broadcast::Receiver<CacheWriteEvent> {
        self.writer.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use ferrofetch_store::StoreConfig;
    use serde_json::json;

    use super::*;

    fn orchestrator() -> CacheOrchestrator {
        CacheOrchestrator::new(
            "quotes",
            Arc::new(PersistentCacheStore::new(StoreConfig::in_memory())),
        )
    }

    async fn exploding_fetch() -> Result<i32, FetchError> {
        panic!("quote decoder bug")
    }

    #[test]
    fn key_patterns_match_prefix_and_regex() {
        let prefix = KeyPattern::prefix("stock:quote:");
        let regex = KeyPattern::regex(r"^crypto:price:(BTC|ETH)$").expect("valid regex");

        assert!(prefix.matches("stock:quote:AAPL"));
        assert!(!prefix.matches("stock:profile:AAPL"));
        assert!(regex.matches("crypto:price:BTC"));
        assert!(!regex.matches("crypto:price:DOGE"));
        assert!(KeyPattern::regex("(").is_err());
    }

    #[tokio::test]
    async fn fetch_error_is_returned_and_nothing_is_cached() {
        let orchestrator = orchestrator();

        let error = orchestrator
            .get_or_fetch::<i32, _, _>(
                "stock:quote:AAPL",
                || async { Err(FetchError::api_call(404, "proxy", "unknown symbol")) },
                Duration::from_secs(30),
            )
            .await
            .expect_err("fetch fails");

        assert_eq!(error.status(), Some(404));
        assert!(orchestrator.store().get_all_keys("quotes").await.is_empty());
        assert_eq!(orchestrator.stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn background_write_reports_completion() {
        let orchestrator = orchestrator();
        let mut writes = orchestrator.subscribe_writes();

        let result = orchestrator
            .get_or_fetch(
                "stock:quote:MSFT",
                || async { Ok(json!({"price": 410.2})) },
                Duration::from_secs(30),
            )
            .await
            .expect("fetch succeeds");
        assert!(!result.cached);

        let event = writes.recv().await.expect("write event");
        assert_eq!(event.key, "stock:quote:MSFT");
        assert_eq!(event.outcome, WriteOutcome::Stored);
    }

    #[tokio::test]
    async fn write_to_undeclared_namespace_fails_quietly() {
        let orchestrator = CacheOrchestrator::new(
            "weather",
            Arc::new(PersistentCacheStore::new(StoreConfig::in_memory())),
        );
        let mut writes = orchestrator.subscribe_writes();

        let result = orchestrator
            .get_or_fetch("city:oslo", || async { Ok(7_i32) }, Duration::from_secs(30))
            .await
            .expect("fetch result survives the failed write");
        assert_eq!(result, Cached { data: 7, cached: false });

        let event = writes.recv().await.expect("write event");
        assert!(matches!(event.outcome, WriteOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn panicking_fetch_frees_the_key_for_the_next_miss() {
        let orchestrator = orchestrator();
        let ttl = Duration::from_secs(30);

        let error = orchestrator
            .get_or_fetch("stock:quote:AAPL", exploding_fetch, ttl)
            .await
            .expect_err("panicked fetch fails the caller");
        assert!(matches!(error, FetchError::Fetch { .. }));
        assert_eq!(orchestrator.stats().await.in_flight, 0);

        let result = orchestrator
            .get_or_fetch("stock:quote:AAPL", || async { Ok(7_i32) }, ttl)
            .await
            .expect("healthy fetch runs");
        assert_eq!(result, Cached { data: 7, cached: false });
        assert_eq!(orchestrator.stats().await.fetches, 2);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_cancel_the_shared_fetch() {
        let orchestrator = orchestrator();
        let mut writes = orchestrator.subscribe_writes();

        let call = orchestrator.get_or_fetch(
            "stock:quote:AAPL",
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({"price": 189.5}))
            },
            Duration::from_secs(30),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(5), call).await;
        assert!(timed_out.is_err());

        let event = tokio::time::timeout(Duration::from_secs(5), writes.recv())
            .await
            .expect("write event within 5s")
            .expect("write channel open");
        assert_eq!(event.outcome, WriteOutcome::Stored);
        assert_eq!(orchestrator.stats().await.in_flight, 0);
        assert_eq!(
            orchestrator.store().get_all_keys("quotes").await,
            vec![String::from("stock:quote:AAPL")]
        );
    }

    #[tokio::test]
    async fn invalidation_wins_over_a_write_still_in_flight() {
        let orchestrator = orchestrator();
        let mut writes = orchestrator.subscribe_writes();
        let ttl = Duration::from_secs(30);

        orchestrator
            .get_or_fetch("stock:quote:AAPL", || async { Ok(1_i32) }, ttl)
            .await
            .expect("first fetch");
        orchestrator.invalidate("stock:quote:AAPL").await;
        writes.recv().await.expect("write event");

        assert!(orchestrator.store().get_all_keys("quotes").await.is_empty());
        let result = orchestrator
            .get_or_fetch("stock:quote:AAPL", || async { Ok(2_i32) }, ttl)
            .await
            .expect("second fetch");
        assert_eq!(result, Cached { data: 2, cached: false });
    }
}
