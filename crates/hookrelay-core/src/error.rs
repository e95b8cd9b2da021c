//! Error types for store access and model decoding.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The backing store rejected a command or could not be reached.
    #[error("store error: {0}")]
    Store(String),

    /// A stored record or caller input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON encoding or decoding of a stored field failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Returns true when the error came from the store itself.
    ///
    /// Store errors are transient from the worker's point of view: the next
    /// poll tick retries the same operation.
    pub const fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<deadpool_redis::redis::RedisError> for CoreError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Store(format!("connection pool: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_transient() {
        assert!(CoreError::Store("connection refused".into()).is_store_unavailable());
        assert!(!CoreError::Serialization("headers".into()).is_store_unavailable());
        assert!(!CoreError::InvalidInput("attempt".into()).is_store_unavailable());
    }

    #[test]
    fn json_errors_map_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(CoreError::from(err), CoreError::Serialization(_)));
    }
}
