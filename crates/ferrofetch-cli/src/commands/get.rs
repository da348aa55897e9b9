use std::sync::Arc;
use std::time::Duration;

use ferrofetch_core::{
    CacheMode, CacheOrchestrator, CachedSource, ExecutorConfig, FallbackExecutor, RequestConfig,
    RequestExecutor, DEFAULT_ENV_PREFIX,
};
use ferrofetch_store::PersistentCacheStore;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::cli::GetArgs;
use crate::error::CliError;

use super::require_namespace;

/// How long the process waits for the background cache write before exiting.
const WRITE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(args: &GetArgs, store: Arc<PersistentCacheStore>) -> Result<Value, CliError> {
    require_namespace(&store, &args.namespace)?;

    let primary = RequestExecutor::new(primary_config(args)?);
    let mut executor = FallbackExecutor::new(primary);
    if let Some(fallback_url) = &args.fallback_url {
        executor = executor.with_secondary(RequestExecutor::new(ExecutorConfig::new(
            "fallback",
            fallback_url.as_str(),
        )));
    }

    let orchestrator = CacheOrchestrator::new(args.namespace.as_str(), store);
    let mut writes = orchestrator.subscribe_writes();
    let source = CachedSource::new(executor, orchestrator);

    let mode = cache_mode(args);
    let response = source
        .fetch::<Value>(
            &args.key,
            &args.endpoint,
            &request_config(args)?,
            Duration::from_secs(args.ttl_secs),
            mode,
        )
        .await?;

    if !response.cached && mode != CacheMode::Bypass {
        wait_for_write(&mut writes, &args.key).await;
    }

    Ok(serde_json::to_value(response)?)
}

fn primary_config(args: &GetArgs) -> Result<ExecutorConfig, CliError> {
    let from_env = ExecutorConfig::from_env(DEFAULT_ENV_PREFIX);
    match (&args.base_url, from_env) {
        (Some(base_url), Some(config)) => Ok(config.with_source("primary").with_base_url(base_url)),
        (Some(base_url), None) => Ok(ExecutorConfig::new("primary", base_url.as_str())),
        (None, Some(config)) => Ok(config.with_source("primary")),
        (None, None) if is_absolute(&args.endpoint) => Ok(ExecutorConfig::new("direct", "")),
        (None, None) => Err(CliError::Validation(String::from(
            "no base URL: pass --base-url, set FERROFETCH_BASE_URL, or use an absolute endpoint",
        ))),
    }
}

fn request_config(args: &GetArgs) -> Result<RequestConfig, CliError> {
    let mut request = RequestConfig::new()
        .with_retries(args.retries)
        .with_retry_delay(Duration::from_millis(args.retry_delay_ms))
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_exponential_backoff(!args.no_backoff);

    for pair in &args.query {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(CliError::Validation(format!(
                "query parameter '{pair}' must be NAME=VALUE"
            )));
        };
        if name.is_empty() {
            return Err(CliError::Validation(format!(
                "query parameter '{pair}' has an empty name"
            )));
        }
        request = request.with_query(name, value);
    }

    Ok(request)
}

fn cache_mode(args: &GetArgs) -> CacheMode {
    if args.bypass {
        CacheMode::Bypass
    } else if args.refresh {
        CacheMode::Refresh
    } else {
        CacheMode::Use
    }
}

fn is_absolute(endpoint: &str) -> bool {
    endpoint.starts_with("http://") || endpoint.starts_with("https://")
}

async fn wait_for_write(
    writes: &mut tokio::sync::broadcast::Receiver<ferrofetch_core::CacheWriteEvent>,
    key: &str,
) {
    let wait = async {
        loop {
            match writes.recv().await {
                Ok(event) if event.key == key => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(WRITE_FLUSH_TIMEOUT, wait).await.is_err() {
        warn!(key, "cache write did not finish before exit");
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};

    fn get_args(argv: &[&str]) -> GetArgs {
        let mut full = vec!["ferrofetch", "get"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("valid arguments").command {
            Command::Get(args) => args,
            Command::Cache(_) => panic!("expected get command"),
        }
    }

    #[test]
    fn query_pairs_keep_order_and_split_on_first_equals() {
        let args = get_args(&[
            "quote",
            "--key",
            "k",
            "--query",
            "symbol=AAPL",
            "--query",
            "filter=a=b",
        ]);

        let request = request_config(&args).expect("valid query");
        assert_eq!(
            request.query,
            vec![
                (String::from("symbol"), String::from("AAPL")),
                (String::from("filter"), String::from("a=b")),
            ]
        );
    }

    #[test]
    fn malformed_query_pair_is_rejected() {
        let args = get_args(&["quote", "--key", "k", "--query", "symbol"]);
        let error = request_config(&args).expect_err("missing '='");
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn no_backoff_selects_constant_delay() {
        let args = get_args(&["quote", "--key", "k", "--no-backoff", "--retry-delay-ms", "250"]);
        let request = request_config(&args).expect("valid");

        assert!(!request.exponential_backoff);
        assert_eq!(request.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn explicit_base_url_wins() {
        let args = get_args(&["quote", "--key", "k", "--base-url", "https://api.example.test"]);
        let config = primary_config(&args).expect("configured");
        assert_eq!(config.base_url, "https://api.example.test");
    }
}
