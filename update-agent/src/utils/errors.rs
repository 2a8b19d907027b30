//! Custom error types for the update agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Updates disabled: {0}")]
    Disabled(String),

    #[error("Invalid state: {0}")]
    Precondition(String),

    #[error("Another update operation is already running")]
    Busy,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpdateError::Network(format!("request timed out: {}", err))
        } else {
            UpdateError::Network(err.to_string())
        }
    }
}

impl UpdateError {
    /// Network-class failures are retried on the next scheduled check.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UpdateError::Network(_) | UpdateError::Http { .. } | UpdateError::Busy
        )
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
