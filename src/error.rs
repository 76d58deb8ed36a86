// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

/// Failures of remote broker calls.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker call timed out")]
    Timeout,
    #[error("broker server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("broker rate limited the request")]
    RateLimited,
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("garbled broker response: {0}")]
    Garbled(String),
}

impl BrokerError {
    /// Timeouts, 5xx and rate-limit responses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Timeout | BrokerError::RateLimited => true,
            BrokerError::Server { status, .. } => *status >= 500,
            BrokerError::Rejected(_) | BrokerError::Garbled(_) => false,
        }
    }
}

/// Error leaving one pipeline stage. Never crosses the pipeline boundary.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("contract violation: {0}")]
    Contract(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid watchlist: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { key: key.into(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Timeout.is_transient());
        assert!(BrokerError::RateLimited.is_transient());
        assert!(BrokerError::Server { status: 503, message: "busy".into() }.is_transient());
        assert!(!BrokerError::Server { status: 400, message: "bad".into() }.is_transient());
        assert!(!BrokerError::Rejected("margin".into()).is_transient());
        assert!(!BrokerError::Garbled("{".into()).is_transient());
    }
}
