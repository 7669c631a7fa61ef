//! Configuration management for the report tracker

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TrackerError};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";

/// Report tracker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Dashboard REST base URL (no trailing slash)
    pub base_url: String,

    /// Real-time endpoint
    pub ws_url: String,

    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,

    /// Polling fallback / status refresh periods
    pub progress_poll_interval: Duration,
    pub status_refresh_interval: Duration,

    /// Reconnect backoff
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,

    /// Keepalive ping period while connected
    pub ping_interval: Duration,

    /// Rendered log caps
    pub progress_log_capacity: usize,
    pub activity_log_capacity: usize,

    /// Where language/theme/client id are persisted (None = memory only)
    pub preferences_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup; unparseable values fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(
                lookup(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(default),
            )
        };

        let base_url = lookup("DASHBOARD_BASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let ws_url = lookup("DASHBOARD_WS_URL").unwrap_or_else(|| derive_ws_url(&base_url));

        Self {
            ws_url,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),

            progress_poll_interval: millis("PROGRESS_POLL_MS", 2_000),
            status_refresh_interval: millis("STATUS_REFRESH_MS", 30_000),

            reconnect_base: millis("RECONNECT_BASE_MS", 1_000),
            reconnect_cap: millis("RECONNECT_CAP_MS", 30_000),
            max_reconnect_attempts: lookup("MAX_RECONNECT_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5),

            ping_interval: Duration::from_secs(
                lookup("PING_INTERVAL_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(30),
            ),

            progress_log_capacity: lookup("PROGRESS_LOG_CAPACITY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            activity_log_capacity: lookup("ACTIVITY_LOG_CAPACITY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(50),

            preferences_path: lookup("PREFERENCES_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),

            base_url,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(TrackerError::Config(format!(
                "base_url must be http(s): {}",
                self.base_url
            )));
        }
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(TrackerError::Config(format!(
                "ws_url must be ws(s): {}",
                self.ws_url
            )));
        }
        if self.progress_poll_interval.is_zero() || self.status_refresh_interval.is_zero() {
            return Err(TrackerError::Config("poll intervals must be positive".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(TrackerError::Config("ping_interval must be positive".into()));
        }
        if self.reconnect_base.is_zero() || self.reconnect_cap < self.reconnect_base {
            return Err(TrackerError::Config(
                "reconnect_cap must be >= reconnect_base > 0".into(),
            ));
        }
        if self.progress_log_capacity == 0 || self.activity_log_capacity == 0 {
            return Err(TrackerError::Config("log capacities must be positive".into()));
        }
        Ok(())
    }
}

/// `http://host:port/x` -> `ws://host:port/ws`
fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else {
        format!("{base_url}/ws")
    }
}
