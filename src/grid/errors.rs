//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("Invalid grid range: {0}")]
    InvalidRange(String),

    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    /// Network hiccup, rate limit or timeout. Safe to retry.
    #[error("Transient exchange error: {0}")]
    TransientExchange(String),

    /// Credentials rejected. Never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Exchange rejected the request for a non-transient reason
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Price feed is stale: last sample {age_ms}ms old")]
    StaleFeed { age_ms: u64 },

    #[error("No price sample available yet")]
    NoPriceAvailable,

    #[error("Reconciliation conflict at level {level}: {reason}")]
    ReconciliationConflict { level: usize, reason: String },

    #[error("Ticker stream error: {0}")]
    Stream(String),

    #[error("Order placement failed after {attempts} attempts: {reason}")]
    OrderPlacementFailed { attempts: u32, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl GridError {
    /// Whether the failed operation may be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridError::TransientExchange(_) | GridError::Stream(_) | GridError::StaleFeed { .. }
        )
    }

    /// Errors that must stop the engine
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GridError::Auth(_) | GridError::InvalidRange(_) | GridError::InvalidConfig(_) | GridError::Config(_)
        )
    }

    /// Short category label used in log lines
    pub fn category(&self) -> &'static str {
        match self {
            GridError::InvalidRange(_) | GridError::InvalidConfig(_) | GridError::Config(_) => "config",
            GridError::TransientExchange(_) | GridError::Exchange(_) | GridError::OrderPlacementFailed { .. } => {
                "exchange"
            }
            GridError::Auth(_) => "auth",
            GridError::StaleFeed { .. } | GridError::NoPriceAvailable | GridError::Stream(_) => "feed",
            GridError::ReconciliationConflict { .. } => "reconcile",
            GridError::JsonParse(_) | GridError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Config(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GridError::TransientExchange("timeout".into()).is_retryable());
        assert!(GridError::Stream("closed".into()).is_retryable());
        assert!(!GridError::Auth("bad key".into()).is_retryable());
        assert!(!GridError::Exchange("insufficient balance".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GridError::Auth("bad key".into()).is_fatal());
        assert!(GridError::InvalidRange("upper <= lower".into()).is_fatal());
        assert!(!GridError::TransientExchange("timeout".into()).is_fatal());
        assert!(!GridError::NoPriceAvailable.is_fatal());
    }

    #[test]
    fn test_category() {
        assert_eq!(GridError::StaleFeed { age_ms: 5 }.category(), "feed");
        assert_eq!(GridError::Auth("x".into()).category(), "auth");
    }
}
