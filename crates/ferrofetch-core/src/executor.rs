//! Single-endpoint request execution with timeout, retry and classification.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::{FetchError, Retryable};
use crate::http_client::{HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
use crate::response::{NormalizedResponse, RateLimitInfo};
use crate::retry::{Backoff, RetryPolicy};

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Per-call request options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    /// Query pairs, appended in order.
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    /// Additional attempts after the first one.
    pub retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub jitter: bool,
    /// Non-2xx statuses treated as retryable. 429 is never retried.
    pub retry_on_status: Vec<u16>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            query: Vec::new(),
            body: None,
            timeout: Duration::from_secs(10),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            jitter: false,
            retry_on_status: Vec::new(),
        }
    }
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn with_retry_on_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry_on_status = statuses.into_iter().filter(|status| *status != 429).collect();
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries,
            Backoff::new(self.retry_delay, self.exponential_backoff),
        )
        .with_jitter(self.jitter)
    }

    fn should_retry(&self, error: &FetchError) -> bool {
        match error {
            FetchError::ApiCall { status, .. } => self.retry_on_status.contains(status),
            other => other.is_retryable(),
        }
    }
}

/// Executes requests against one upstream.
#[derive(Clone)]
pub struct RequestExecutor {
    http_client: Arc<dyn HttpClient>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Executor backed by [`ReqwestHttpClient`].
    pub fn new(config: ExecutorConfig) -> Self {
        let client = match &config.user_agent {
            Some(user_agent) => ReqwestHttpClient::with_user_agent(user_agent),
            None => ReqwestHttpClient::new(),
        };
        Self::with_http_client(Arc::new(client), config)
    }

    pub fn with_http_client(http_client: Arc<dyn HttpClient>, config: ExecutorConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn source(&self) -> &str {
        &self.config.source
    }

    pub fn with_fallback_available(mut self, available: bool) -> Self {
        self.config.fallback_available = available;
        self
    }

    /// Joins the base URL and `endpoint` and appends encoded query pairs.
    ///
    /// Absolute endpoints (`http://`, `https://`) ignore the base URL.
    pub fn build_url(&self, endpoint: &str, query: &[(String, String)]) -> String {
        let mut url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if self.config.base_url.is_empty() {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            )
        };

        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(name, value)| {
                    format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&encoded);
        }

        url
    }

    /// Resolves the transport request: default headers, user agent and auth
    /// first, per-call headers last.
    pub fn build_request(&self, endpoint: &str, request: &RequestConfig) -> HttpRequest {
        let mut http_request = HttpRequest::new(request.method, self.build_url(endpoint, &request.query))
            .with_timeout(request.timeout);

        http_request.headers.extend(self.config.default_headers.clone());
        if let Some(user_agent) = &self.config.user_agent {
            http_request
                .headers
                .insert(String::from("user-agent"), user_agent.clone());
        }
        self.config.auth.apply(&mut http_request.headers);
        for (name, value) in &request.headers {
            http_request
                .headers
                .insert(name.to_ascii_lowercase(), value.clone());
        }

        if let Some(body) = &request.body {
            http_request
                .headers
                .entry(String::from("content-type"))
                .or_insert_with(|| String::from("application/json"));
            http_request.body = Some(body.clone());
        }

        http_request
    }

    /// Executes `endpoint` and decodes the JSON body into `T`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &RequestConfig,
    ) -> Result<NormalizedResponse<T>, FetchError> {
        self.execute_observed(endpoint, request, &|_attempt: u32| {})
            .await
    }

    /// Like [`execute`](Self::execute), calling `on_attempt` with the 0-based
    /// attempt index right before each attempt is sent.
    pub async fn execute_observed<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &RequestConfig,
        on_attempt: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<NormalizedResponse<T>, FetchError> {
        let response = self.send(endpoint, request, on_attempt).await?;
        let data = serde_json::from_str::<T>(&response.body)
            .map_err(|error| FetchError::decode(self.source(), error.to_string()))?;
        Ok(NormalizedResponse::ok(data, self.source()))
    }

    /// Executes `endpoint` with retries and returns the successful response.
    pub async fn execute_raw(&self, endpoint: &str, request: &RequestConfig) -> Result<HttpResponse, FetchError> {
        self.send(endpoint, request, &|_attempt: u32| {}).await
    }

    async fn send(
        &self,
        endpoint: &str,
        request: &RequestConfig,
        on_attempt: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<HttpResponse, FetchError> {
        let http_request = self.build_request(endpoint, request);
        let policy = request.retry_policy();

        let result = policy
            .run_with(
                |attempt| {
                    on_attempt(attempt);
                    let http_request = http_request.clone();
                    async move {
                        debug!(
                            source = %self.config.source,
                            method = %http_request.method,
                            url = %http_request.url,
                            attempt = attempt + 1,
                            "sending request"
                        );
                        self.attempt(http_request, request.timeout).await
                    }
                },
                |error: &FetchError| request.should_retry(error),
            )
            .await;

        result.map_err(|failure| {
            if failure.exhausted {
                warn!(
                    source = %self.config.source,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "retries exhausted"
                );
                FetchError::data_fetch(
                    self.source(),
                    self.config.fallback_available,
                    failure.attempts,
                    failure.error,
                )
            } else {
                failure.error
            }
        })
    }

    async fn attempt(&self, request: HttpRequest, timeout: Duration) -> Result<HttpResponse, FetchError> {
        let source = self.source();
        let response = match tokio::time::timeout(timeout, self.http_client.execute(request)).await {
            Err(_) => return Err(FetchError::timeout(source, timeout.as_millis())),
            Ok(Err(error)) if error.timed_out() => {
                return Err(FetchError::timeout(source, timeout.as_millis()))
            }
            Ok(Err(error)) => return Err(FetchError::transport(source, error.message())),
            Ok(Ok(response)) => response,
        };

        if response.is_success() {
            return Ok(response);
        }

        if response.status == 429 {
            let info = RateLimitInfo::from_headers(source, &response.headers);
            warn!(source, reset = info.reset, wait_ms = info.wait_ms(), "rate limited");
            return Err(FetchError::rate_limit(info));
        }

        Err(FetchError::api_call(
            response.status,
            source,
            error_message(&response),
        ))
    }
}

fn error_message(response: &HttpResponse) -> String {
    let body = response.body.trim();
    if body.is_empty() {
        return format!("HTTP {}", response.status);
    }
    body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http_client::{HttpAuth, HttpError, HttpFuture};

    #[derive(Default)]
    struct CapturingClient {
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl HttpClient for CapturingClient {
        fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
            self.requests
                .lock()
                .expect("requests lock poisoned")
                .push(request);
            Box::pin(async { Ok(HttpResponse::ok_json(r#"{"price":189.5}"#)) })
        }
    }

    struct FailingClient;

    impl HttpClient for FailingClient {
        fn execute<'a>(&'a self, _request: HttpRequest) -> HttpFuture<'a> {
            Box::pin(async { Err(HttpError::new("connection refused")) })
        }
    }

    fn executor(base_url: &str) -> RequestExecutor {
        RequestExecutor::with_http_client(
            Arc::new(CapturingClient::default()),
            ExecutorConfig::new("proxy", base_url),
        )
    }

    #[test]
    fn build_url_joins_with_a_single_slash() {
        let executor = executor("https://api.example.test/v1/");

        assert_eq!(
            executor.build_url("/quote", &[]),
            "https://api.example.test/v1/quote"
        );
        assert_eq!(
            executor.build_url("quote", &[]),
            "https://api.example.test/v1/quote"
        );
    }

    #[test]
    fn build_url_encodes_query_pairs_in_order() {
        let executor = executor("https://api.example.test");
        let query = vec![
            (String::from("symbol"), String::from("BRK.B")),
            (String::from("q"), String::from("a b&c")),
        ];

        assert_eq!(
            executor.build_url("quote", &query),
            "https://api.example.test/quote?symbol=BRK.B&q=a%20b%26c"
        );
        assert_eq!(
            executor.build_url("quote?fmt=json", &query[..1]),
            "https://api.example.test/quote?fmt=json&symbol=BRK.B"
        );
    }

    #[test]
    fn absolute_endpoints_ignore_base_url() {
        let executor = executor("https://api.example.test");
        assert_eq!(
            executor.build_url("https://other.example.test/news", &[]),
            "https://other.example.test/news"
        );
    }

    #[test]
    fn per_call_headers_override_defaults() {
        let executor = RequestExecutor::with_http_client(
            Arc::new(CapturingClient::default()),
            ExecutorConfig::new("proxy", "https://api.example.test")
                .with_default_header("Accept", "text/plain")
                .with_default_header("X-Client", "ferrofetch")
                .with_auth(HttpAuth::BearerToken(String::from("t0k"))),
        );
        let request = RequestConfig::new()
            .with_method(HttpMethod::Post)
            .with_header("ACCEPT", "application/json")
            .with_body(r#"{"symbols":["AAPL"]}"#)
            .with_timeout(Duration::from_millis(750));

        let http_request = executor.build_request("batch", &request);

        assert_eq!(http_request.method, HttpMethod::Post);
        assert_eq!(http_request.timeout_ms, 750);
        assert_eq!(http_request.headers.get("accept").map(String::as_str), Some("application/json"));
        assert_eq!(http_request.headers.get("x-client").map(String::as_str), Some("ferrofetch"));
        assert_eq!(http_request.headers.get("authorization").map(String::as_str), Some("Bearer t0k"));
        assert_eq!(
            http_request.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn retry_on_status_never_includes_429() {
        let request = RequestConfig::new().with_retry_on_status([429, 503]);
        assert_eq!(request.retry_on_status, vec![503]);
        assert!(request.should_retry(&FetchError::api_call(503, "proxy", "busy")));
        assert!(!request.should_retry(&FetchError::api_call(500, "proxy", "boom")));
    }

    #[tokio::test]
    async fn successful_response_is_normalized() {
        let client = Arc::new(CapturingClient::default());
        let executor = RequestExecutor::with_http_client(
            Arc::clone(&client) as Arc<dyn HttpClient>,
            ExecutorConfig::new("proxy", "https://api.example.test"),
        );

        let response = executor
            .execute::<serde_json::Value>("quote", &RequestConfig::new().with_query("symbol", "AAPL"))
            .await
            .expect("success");

        assert!(response.success);
        assert!(!response.cached);
        assert_eq!(response.source, "proxy");
        assert_eq!(response.data["price"], 189.5);

        let requests = client.requests.lock().expect("requests lock poisoned");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://api.example.test/quote?symbol=AAPL");
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_fallback_flag() {
        let executor = RequestExecutor::with_http_client(
            Arc::new(FailingClient),
            ExecutorConfig::new("proxy", "https://api.example.test").with_fallback_available(true),
        );
        let request = RequestConfig::new()
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(1));

        let error = executor
            .execute::<serde_json::Value>("quote", &request)
            .await
            .expect_err("transport always fails");

        match error {
            FetchError::DataFetch {
                attempts,
                fallback_used,
                last,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(fallback_used);
                assert_eq!(last.code(), "transport.failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let executor = executor("https://api.example.test");

        let error = executor
            .execute::<Vec<String>>("quote", &RequestConfig::new())
            .await
            .expect_err("object is not a list");

        assert_eq!(error.code(), "response.decode");
    }
}
