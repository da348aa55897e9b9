use std::collections::BTreeMap;
use std::env;

use crate::http_client::HttpAuth;

/// Env-var prefix used by [`ExecutorConfig::from_env`] when none is given.
pub const DEFAULT_ENV_PREFIX: &str = "FERROFETCH";

/// Header carrying the API key read from `<PREFIX>_API_KEY`.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Per-upstream settings for a [`RequestExecutor`](crate::RequestExecutor).
///
/// # Environment Variables
///
/// | Variable | Field |
/// |----------|-------|
/// | `<PREFIX>_BASE_URL` | `base_url` |
/// | `<PREFIX>_API_KEY` | `auth` as an `x-api-key` header |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Name reported in responses and errors.
    pub source: String,
    pub base_url: String,
    /// Applied before per-call headers. Names are lower-case.
    pub default_headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    /// Advertised through `DataFetch::fallback_used` on exhaustion.
    pub fallback_available: bool,
    pub auth: HttpAuth,
}

impl ExecutorConfig {
    pub fn new(source: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            base_url: base_url.into(),
            default_headers: BTreeMap::new(),
            user_agent: None,
            fallback_available: false,
            auth: HttpAuth::None,
        }
    }

    /// Reads `<prefix>_BASE_URL` and `<prefix>_API_KEY`.
    ///
    /// Returns `None` when no base URL is configured.
    pub fn from_env(prefix: &str) -> Option<Self> {
        let prefix = prefix.trim_end_matches('_').to_ascii_uppercase();
        let base_url = env::var(format!("{prefix}_BASE_URL"))
            .ok()
            .filter(|value| !value.trim().is_empty())?;

        let mut config = Self::new(prefix.to_ascii_lowercase(), base_url.trim());
        if let Some(key) = env::var(format!("{prefix}_API_KEY"))
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            config = config.with_api_key(key);
        }
        Some(config)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_fallback_available(mut self, available: bool) -> Self {
        self.fallback_available = available;
        self
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_api_key(self, key: impl Into<String>) -> Self {
        self.with_auth(HttpAuth::Header {
            name: String::from(API_KEY_HEADER),
            value: key.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_headers_are_lower_cased() {
        let config = ExecutorConfig::new("proxy", "https://api.example.test")
            .with_default_header("Accept", "application/json");

        assert_eq!(
            config.default_headers.get("accept").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn from_env_reads_base_url_and_api_key() {
        env::set_var("FFTEST_CONFIG_BASE_URL", "https://proxy.example.test");
        env::set_var("FFTEST_CONFIG_API_KEY", "secret");

        let config = ExecutorConfig::from_env("FFTEST_CONFIG_").expect("configured");

        assert_eq!(config.base_url, "https://proxy.example.test");
        assert_eq!(config.source, "fftest_config");
        assert_eq!(
            config.auth,
            HttpAuth::Header {
                name: String::from("x-api-key"),
                value: String::from("secret"),
            }
        );

        env::remove_var("FFTEST_CONFIG_BASE_URL");
        env::remove_var("FFTEST_CONFIG_API_KEY");
    }

    #[test]
    fn from_env_without_base_url_is_none() {
        assert!(ExecutorConfig::from_env("FFTEST_MISSING").is_none());
    }
}
