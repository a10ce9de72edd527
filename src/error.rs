//! Error types for agent-firewall.

use thiserror::Error;

/// Result type alias using agent-firewall's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the firewall.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Classifier backend error
    #[error("Classifier error: {backend} - {message}")]
    Classifier { backend: String, message: String },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Upstream server error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Subprocess communication error
    #[error("Subprocess communication error: {0}")]
    SubprocessComm(String),

    /// Audit sink error
    #[error("Audit sink error: {0}")]
    Audit(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a classifier backend error.
    pub fn classifier(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Classifier {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an upstream error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }
}
