//! CLI argument definitions for ferrofetch.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `get` | Fetch an endpoint through the cache |
//! | `cache` | Inspect, clear and invalidate the local cache |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--home` | `$FERROFETCH_HOME` or `~/.ferrofetch` | Directory holding `cache/cache.duckdb` |
//! | `--memory` | `false` | Use a throwaway in-memory store |
//!
//! # Examples
//!
//! ```bash
//! FERROFETCH_BASE_URL=https://api.example.com \
//!   ferrofetch get quote --key stock:quote:AAPL --query symbol=AAPL --ttl-secs 30
//!
//! ferrofetch cache keys --namespace quotes
//! ferrofetch cache invalidate-regex '^stock:quote:'
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "ferrofetch",
    author,
    version,
    about = "Resilient cached fetches from the command line"
)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Home directory for the persistent cache.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Keep the cache in memory for this invocation only.
    #[arg(long, global = true, default_value_t = false)]
    pub memory: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch an endpoint, serving it from the cache when a live entry exists.
    ///
    /// The base URL comes from `--base-url` or `FERROFETCH_BASE_URL`;
    /// `FERROFETCH_API_KEY` is sent as `x-api-key`.
    Get(GetArgs),

    /// Cache management commands.
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Endpoint path relative to the base URL, or an absolute URL.
    pub endpoint: String,

    /// Cache key, e.g. `stock:quote:AAPL`.
    #[arg(long)]
    pub key: String,

    /// Time-to-live of the cached entry in seconds.
    #[arg(long, default_value_t = 60)]
    pub ttl_secs: u64,

    /// Query parameter as `name=value`. Repeatable.
    #[arg(long = "query", value_name = "NAME=VALUE")]
    pub query: Vec<String>,

    /// Additional attempts after the first one.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Base delay between attempts in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub retry_delay_ms: u64,

    /// Per-attempt timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Use a constant delay instead of exponential backoff.
    #[arg(long, default_value_t = false)]
    pub no_backoff: bool,

    /// Cache namespace.
    #[arg(long, default_value = "quotes")]
    pub namespace: String,

    /// Overrides `FERROFETCH_BASE_URL`.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Secondary base URL tried when the primary fails.
    #[arg(long)]
    pub fallback_url: Option<String>,

    /// Skip the cache lookup and overwrite the entry.
    #[arg(long, default_value_t = false, conflicts_with = "bypass")]
    pub refresh: bool,

    /// Neither read nor write the cache.
    #[arg(long, default_value_t = false)]
    pub bypass: bool,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    /// Cache namespace.
    #[arg(long, global = true, default_value = "quotes")]
    pub namespace: String,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Entry counts and hit totals for the namespace.
    Stats,

    /// List keys in the namespace.
    Keys,

    /// Remove every entry in the namespace.
    Clear {
        /// Clear every declared namespace.
        #[arg(long, default_value_t = false)]
        all: bool,
    },

    /// Remove one key.
    Invalidate { key: String },

    /// Remove keys starting with a prefix.
    InvalidatePrefix { prefix: String },

    /// Remove keys matching a regular expression.
    InvalidateRegex { pattern: String },
}
