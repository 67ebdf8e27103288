//! Client configuration.
//!
//! One base URL drives both the REST origin and the socket endpoint:
//! ```text
//! https://api.example.com          → https://api.example.com/shrimp
//!                                     wss://api.example.com/shrimp/ws
//! http://localhost:3000/           → http://localhost:3000
//!                                     ws://localhost:3000/ws
//! ```

use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigError;
use crate::scheduler::BackoffPolicy;
use crate::topic::CatchupPolicy;

/// Path the API is mounted under on non-local hosts.
pub const DEFAULT_DEPLOYMENT_PATH: &str = "/shrimp";

/// Base URL used when nothing is configured.
pub const DEFAULT_API_BASE: &str = "http://localhost:3000";

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Normalized API base (no trailing slash).
    pub api_base: String,
    /// Reconnect delays
    pub backoff: BackoffPolicy,
    /// Catch-up retry limits for versioned feeds
    pub catchup: CatchupPolicy,
    /// Interval between pings while open
    pub heartbeat_interval: Duration,
    /// Upper bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Upper bound on a REST request
    pub request_timeout: Duration,
    /// Maximum messages held while the socket is down
    pub queue_capacity: usize,
    /// Delay between session-open retries after transient failures
    pub open_retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            backoff: BackoffPolicy::default(),
            catchup: CatchupPolicy::default(),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            queue_capacity: 1024,
            open_retry_interval: Duration::from_millis(800),
        }
    }
}

impl ClientConfig {
    /// Config for `base` with default tuning.
    pub fn new(base: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: normalize_api_base(base)?,
            ..Self::default()
        })
    }

    /// Build from `SOV_API_BASE_URL` (or `SOV_API_URL`) and `SOV_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = std::env::var("SOV_API_BASE_URL")
            .or_else(|_| std::env::var("SOV_API_URL"))
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let mut config = Self::new(&base)?;

        if let Ok(raw) = std::env::var("SOV_HEARTBEAT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("SOV_HEARTBEAT_SECS", "expected seconds"))?;
            if secs == 0 {
                return Err(ConfigError::InvalidEnv(
                    "SOV_HEARTBEAT_SECS",
                    "must be greater than zero",
                ));
            }
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Socket endpoint: same host, `/ws` appended, `http→ws`, `https→wss`.
    pub fn ws_url(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}/ws")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}/ws")
        } else {
            format!("{base}/ws")
        }
    }

    /// REST URL for `path` (leading slash optional).
    pub fn rest_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Parse and normalize an API base URL.
///
/// Trailing slashes are stripped; a non-local host with an empty path is
/// mounted under [`DEFAULT_DEPLOYMENT_PATH`].
pub fn normalize_api_base(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let is_local = matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1");

    let path = url.path().trim_end_matches('/').to_string();
    if path.is_empty() && !is_local {
        url.set_path(DEFAULT_DEPLOYMENT_PATH);
    } else {
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}
