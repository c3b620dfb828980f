//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start with zero
//! configuration against the placeholder production endpoint.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    API_URL_ENV, API_URL_ENV_FALLBACK, DEFAULT_API_URL, DEFAULT_MESSAGE_LIMIT, TYPING_TTL_SECS,
};

/// Where the offline cache lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// Platform cache directory.
    Default,
    Path(PathBuf),
    Disabled,
}

/// Chat client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// REST base URL.
    /// Env: `CHAT_API_URL`, falling back to `NEXT_PUBLIC_API_URL`
    /// Default: `https://api.parley.example/api`
    pub api_url: String,

    /// Size of a message page and of the live message window.
    /// Env: `CHAT_MESSAGE_LIMIT`
    /// Default: `50`
    pub message_limit: usize,

    /// Per-request timeout for REST calls. `None` waits indefinitely.
    /// Env: `CHAT_REQUEST_TIMEOUT_SECS` (`0` disables)
    /// Default: none
    pub request_timeout: Option<Duration>,

    /// Offline cache database.
    /// Env: `CHAT_CACHE_PATH` (a file path, or `off`)
    /// Default: platform cache directory
    pub cache: CacheLocation,

    /// Age after which a typing entry is ignored.
    /// Env: `CHAT_TYPING_TTL_SECS`
    /// Default: `5`
    pub typing_ttl: chrono::Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            message_limit: DEFAULT_MESSAGE_LIMIT,
            request_timeout: None,
            cache: CacheLocation::Default,
            typing_ttl: chrono::Duration::seconds(TYPING_TTL_SECS),
        }
    }
}

impl ChatConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(API_URL_ENV)
            .or_else(|| lookup(API_URL_ENV_FALLBACK))
            .filter(|u| !u.trim().is_empty())
        {
            if url::Url::parse(&url).is_ok() {
                config.api_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid {API_URL_ENV}, using default");
            }
        }

        if let Some(limit) = lookup("CHAT_MESSAGE_LIMIT") {
            match limit.parse::<usize>() {
                Ok(n) if n > 0 => config.message_limit = n,
                _ => tracing::warn!(value = %limit, "Invalid CHAT_MESSAGE_LIMIT, using default"),
            }
        }

        if let Some(secs) = lookup("CHAT_REQUEST_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(0) => config.request_timeout = None,
                Ok(n) => config.request_timeout = Some(Duration::from_secs(n)),
                Err(_) => tracing::warn!(
                    value = %secs,
                    "Invalid CHAT_REQUEST_TIMEOUT_SECS, requests will not time out"
                ),
            }
        }

        if let Some(path) = lookup("CHAT_CACHE_PATH") {
            config.cache = match path.trim() {
                "" => CacheLocation::Default,
                p if p.eq_ignore_ascii_case("off") => CacheLocation::Disabled,
                p => CacheLocation::Path(PathBuf::from(p)),
            };
        }

        if let Some(secs) = lookup("CHAT_TYPING_TTL_SECS") {
            match secs.parse::<i64>() {
                Ok(n) if n > 0 => config.typing_ttl = chrono::Duration::seconds(n),
                _ => tracing::warn!(value = %secs, "Invalid CHAT_TYPING_TTL_SECS, using default"),
            }
        }

        config
    }
}
