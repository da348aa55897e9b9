mod cache;
mod get;

use std::sync::Arc;

use ferrofetch_store::{PersistentCacheStore, StoreConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub async fn run(cli: &Cli) -> Result<Value, CliError> {
    let store = Arc::new(PersistentCacheStore::new(store_config(cli)));

    match &cli.command {
        Command::Get(args) => get::run(args, store).await,
        Command::Cache(args) => cache::run(args, store).await,
    }
}

fn store_config(cli: &Cli) -> StoreConfig {
    if cli.memory {
        return StoreConfig::in_memory();
    }
    match &cli.home {
        Some(home) => StoreConfig::duckdb(home.join("cache").join("cache.duckdb")),
        None => StoreConfig::default(),
    }
}

/// Rejects namespaces the store was not configured with; the store itself
/// would silently degrade.
fn require_namespace(store: &PersistentCacheStore, namespace: &str) -> Result<(), CliError> {
    if store.namespaces().iter().any(|declared| declared == namespace) {
        return Ok(());
    }
    Err(CliError::Validation(format!(
        "unknown namespace '{namespace}' (expected one of: {})",
        store.namespaces().join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[tokio::test]
    async fn cache_commands_round_trip_through_a_duckdb_home() {
        let home = tempfile::tempdir().expect("temp dir");
        let home_arg = home.path().to_string_lossy().to_string();

        let keys = Cli::try_parse_from(["ferrofetch", "--home", &home_arg, "cache", "keys"])
            .expect("valid arguments");
        assert_eq!(run(&keys).await.expect("keys"), serde_json::json!([]));

        let stats = Cli::try_parse_from(["ferrofetch", "--home", &home_arg, "cache", "stats"])
            .expect("valid arguments");
        let output = run(&stats).await.expect("stats");
        assert_eq!(output["namespace"], "quotes");
        assert_eq!(output["total_entries"], 0);
        assert!(home.path().join("cache").join("cache.duckdb").exists());
    }

    #[tokio::test]
    async fn unknown_namespace_is_a_validation_error() {
        let cli = Cli::try_parse_from(["ferrofetch", "--memory", "cache", "keys", "--namespace", "weather"])
            .expect("valid arguments");

        let error = run(&cli).await.expect_err("undeclared namespace");
        assert_eq!(error.exit_code(), 2);
    }
}
