use std::sync::Arc;

use ferrofetch_core::{CacheOrchestrator, KeyPattern};
use ferrofetch_store::PersistentCacheStore;
use serde_json::{json, Value};

use crate::cli::{CacheArgs, CacheCommand};
use crate::error::CliError;

use super::require_namespace;

pub async fn run(args: &CacheArgs, store: Arc<PersistentCacheStore>) -> Result<Value, CliError> {
    let namespace = args.namespace.as_str();
    if !matches!(args.command, CacheCommand::Clear { all: true }) {
        require_namespace(&store, namespace)?;
    }
    let orchestrator = CacheOrchestrator::new(namespace, Arc::clone(&store));

    match &args.command {
        CacheCommand::Stats => {
            let stats = store.get_stats(namespace).await;
            Ok(json!({
                "namespace": namespace,
                "total_entries": stats.total_entries,
                "expired_not_yet_purged": stats.expired_not_yet_purged,
                "total_hits": stats.total_hits,
            }))
        }
        CacheCommand::Keys => Ok(json!(store.get_all_keys(namespace).await)),
        CacheCommand::Clear { all: true } => {
            store.clear_all().await;
            Ok(json!({ "cleared": store.namespaces() }))
        }
        CacheCommand::Clear { all: false } => {
            store.clear(namespace).await;
            Ok(json!({ "cleared": [namespace] }))
        }
        CacheCommand::Invalidate { key } => {
            orchestrator.invalidate(key).await;
            Ok(json!({ "namespace": namespace, "invalidated": key }))
        }
        CacheCommand::InvalidatePrefix { prefix } => {
            let removed = orchestrator
                .invalidate_pattern(&KeyPattern::prefix(prefix.as_str()))
                .await;
            Ok(json!({ "namespace": namespace, "removed": removed }))
        }
        CacheCommand::InvalidateRegex { pattern } => {
            let pattern = KeyPattern::regex(pattern)
                .map_err(|error| CliError::Validation(format!("invalid pattern: {error}")))?;
            let removed = orchestrator.invalidate_pattern(&pattern).await;
            Ok(json!({ "namespace": namespace, "removed": removed }))
        }
    }
}
