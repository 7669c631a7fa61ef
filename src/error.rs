//! Error types for the report tracker
//!
//! Uses thiserror for ergonomic error definitions.
//! Nothing here is allowed to escape into rendering code: callers log and
//! convert every failure into an activity line or a notice.

use thiserror::Error;

/// Custom Result type using our Error
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Report tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Dashboard API returned a non-success status
    #[error("Dashboard API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Real-time channel errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation needs a live real-time link
    #[error("Not connected")]
    NotConnected,

    /// Preference storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        TrackerError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TrackerError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::Api {
            status: 404,
            message: "Session not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Dashboard API error: HTTP 404: Session not found"
        );
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err: TrackerError = json_err.into();
        assert!(matches!(err, TrackerError::Json(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TrackerError = io_err.into();
        assert!(matches!(err, TrackerError::Storage(_)));
    }
}
