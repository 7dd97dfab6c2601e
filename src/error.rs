use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failure of a single network attempt
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportError {
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout { timeout_ms: 0 }
        } else if err.is_connect() {
            TransportError::ConnectionRefused(err.to_string())
        } else if err.is_request() {
            TransportError::Aborted(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// Authentication failures; invalid credentials are terminal
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials (HTTP {status})")]
    InvalidCredentials { status: u16 },

    #[error("Authentication service unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed session payload: {0}")]
    Malformed(String),
}

impl AuthError {
    /// Whether retrying could ever succeed
    pub fn recoverable(&self) -> bool {
        !matches!(self, AuthError::InvalidCredentials { .. })
    }
}

/// Errors surfaced by the engine's internal plumbing.
///
/// Public entry points convert these into result values before they reach
/// callers; the type is still public so strategies and stores implemented
/// outside the crate can report failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Strategy '{strategy_id}' failed: {reason}")]
    Strategy { strategy_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine is not initialized")]
    NotInitialized,
}

impl EngineError {
    pub fn strategy(strategy_id: &str, reason: impl Into<String>) -> Self {
        EngineError::Strategy {
            strategy_id: strategy_id.to_string(),
            reason: reason.into(),
        }
    }
}
