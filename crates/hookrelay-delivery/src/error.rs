//! Error types for webhook delivery.
//!
//! Attempt failures (transport errors and non-2xx responses) never escape
//! the delivery client as `Err`; they are carried inside a
//! `DeliveryOutcome` so that the worker can record them. The remaining
//! variants describe failures of the machinery around delivery: the store,
//! configuration, and worker supervision.

use std::{fmt, time::Duration};

use hookrelay_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering webhooks or running workers.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection, DNS or protocol failure before a response arrived.
    #[error("network error: {message}")]
    NetworkError {
        /// Error message describing the failure
        message: String,
    },

    /// The request did not complete within the total request timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Endpoint answered with 4xx.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
    },

    /// Endpoint answered with 5xx.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
    },

    /// Endpoint answered with a status outside 2xx, 4xx and 5xx.
    #[error("unexpected status: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// The job could not be turned into a valid HTTP request.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request
        message: String,
    },

    /// The job store was unreachable or rejected a command.
    #[error("store error: {message}")]
    StoreError {
        /// Store error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Classifies a non-2xx status code.
    pub fn from_status(status_code: u16) -> Self {
        match status_code {
            400..=499 => Self::ClientError { status_code },
            500..=599 => Self::ServerError { status_code },
            _ => Self::UnexpectedStatus { status_code },
        }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// HTTP status carried by response-level failures.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code }
            | Self::ServerError { status_code }
            | Self::UnexpectedStatus { status_code } => Some(*status_code),
            _ => None,
        }
    }

    /// Whether the endpoint never produced a response.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::Timeout { .. })
    }

    /// Whether this is a store failure, which workers treat as "nothing to
    /// do this tick".
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::StoreError { .. })
    }

    /// Category label for logs.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Store(message) => Self::StoreError { message },
            other => Self::InternalError { message: other.to_string() },
        }
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No response from the endpoint.
    Network,
    /// 4xx responses.
    Client,
    /// 5xx responses.
    Server,
    /// Other non-2xx responses.
    Protocol,
    /// Requests that could not be built.
    Request,
    /// Job store failures.
    Store,
    /// Configuration problems.
    Configuration,
    /// Worker supervision and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::UnexpectedStatus { .. } => Self::Protocol,
            DeliveryError::InvalidRequest { .. } => Self::Request,
            DeliveryError::StoreError { .. } => Self::Store,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Protocol => write!(f, "protocol"),
            Self::Request => write!(f, "request"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified() {
        assert!(matches!(DeliveryError::from_status(404), DeliveryError::ClientError { .. }));
        assert!(matches!(DeliveryError::from_status(503), DeliveryError::ServerError { .. }));
        assert!(matches!(DeliveryError::from_status(302), DeliveryError::UnexpectedStatus { .. }));
        assert_eq!(DeliveryError::from_status(500).status_code(), Some(500));
    }

    #[test]
    fn transport_failures_have_no_status() {
        let timeout = DeliveryError::timeout(Duration::from_secs(5));
        assert!(timeout.is_transport());
        assert_eq!(timeout.status_code(), None);
        assert!(DeliveryError::network("connection refused").is_transport());
        assert!(!DeliveryError::from_status(500).is_transport());
    }

    #[test]
    fn core_store_errors_stay_store_errors() {
        let err = DeliveryError::from(CoreError::Store("connection refused".into()));
        assert!(err.is_store());

        let err = DeliveryError::from(CoreError::InvalidInput("bad attempt".into()));
        assert!(!err.is_store());
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::from_status(500).to_string(), "server error: HTTP 500");
        assert_eq!(
            DeliveryError::timeout(Duration::from_millis(1500)).to_string(),
            "request timed out after 1500ms"
        );
        assert_eq!(ErrorCategory::Store.to_string(), "store");
    }
}
