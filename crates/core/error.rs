//! Error types for the tq job processor.

use thiserror::Error;

/// The main error type for the tq library.
#[derive(Error, Debug)]
pub enum TqError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store-specific error (connection lost, bad query, corrupt row).
    #[error("Backend error: {0}")]
    Backend(String),

    /// Transient lock condition reported by the store (busy, deadlock,
    /// serialization failure). Callers treat it like "nothing to do".
    #[error("Store contention: {0}")]
    Contention(String),

    /// A worker is already bound to this queue name.
    #[error("Worker already registered for queue: {0}")]
    WorkerAlreadyRegistered(String),

    /// Queue manager lifecycle error.
    #[error("Queue manager error: {0}")]
    Manager(String),
}

impl TqError {
    /// Whether the error is a transient lock condition that should be retried
    /// on a later poll tick rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, TqError::Contention(_))
    }
}

/// Result type alias using TqError.
pub type Result<T> = std::result::Result<T, TqError>;
