//! Error types for the lodestore-store crate.
//!
//! All adapter operations return [`StoreError`] via [`StoreResult`].
//! Broker failures are folded in so callers see one error type; the
//! `KeyExists` collision is lifted to its own variant because the HTTP layer
//! reports it distinctly.

use lodestore_broker::BrokerError;
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A create-only cache write collided with a live entry.
    #[error("key already exists: {key}")]
    KeyExists { key: String },

    /// The adapter does not implement the requested method.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The key-value broker failed.
    #[error("broker error: {0}")]
    Broker(BrokerError),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<BrokerError> for StoreError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::KeyExists { key } => Self::KeyExists { key },
            other => Self::Broker(other),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exists_is_lifted() {
        let err: StoreError = BrokerError::KeyExists { key: "7".into() }.into();
        assert!(matches!(err, StoreError::KeyExists { ref key } if key == "7"));

        let err: StoreError = BrokerError::ConnectionClosed.into();
        assert!(matches!(err, StoreError::Broker(BrokerError::ConnectionClosed)));
    }
}
