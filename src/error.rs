//! Error types for reqtrack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing input. Never reaches the store or the queue.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Missing or incorrect admin credential.
    #[error("unauthorized")]
    Unauthorized,

    /// Requester token does not match the stored token.
    #[error("forbidden")]
    Forbidden,

    #[error("request not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Store failure from a backend that is not sqlx (or an unreachable store).
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("queue error: {0}")]
    Queue(String),

    /// A queue payload that is not a valid status-changed event.
    #[error("malformed message: {0}")]
    MessageFormat(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Store or queue failures: server errors on the API path, retry-by-redelivery
    /// on the worker path.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Persistence(_) | Error::Queue(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
