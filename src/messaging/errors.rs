//! # Queue Backend Error Types
//!
//! Structured errors raised by [`QueueBackend`](super::QueueBackend)
//! implementations. The pub/sub layer only reacts to two classes of
//! failure: throttling (retried with a fixed backoff) and "not found"
//! (treated as a benign, already-gone resource). Everything else is
//! surfaced to the caller unchanged.

use thiserror::Error;

/// Errors produced by a point-to-point queue backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend throttled operation {operation}: {message}")]
    Throttled { operation: String, message: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Queue already exists: {queue}")]
    QueueAlreadyExists { queue: String },

    #[error("Permission denied for queue: {queue}: {message}")]
    PermissionDenied { queue: String, message: String },

    #[error("Queue operation failed: {queue}: {operation}: {message}")]
    QueueOperation {
        queue: String,
        operation: String,
        message: String,
    },

    #[error("Internal backend error: {message}")]
    Internal { message: String },
}

impl BackendError {
    /// Create a throttling error
    pub fn throttled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Throttled {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    /// Create a queue already exists error
    pub fn queue_already_exists(queue: impl Into<String>) -> Self {
        Self::QueueAlreadyExists {
            queue: queue.into(),
        }
    }

    /// Create a permission error
    pub fn permission_denied(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue: queue.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Transient rate limiting; the only signal the retry policy reacts to
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// The target queue (or message lease) no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound { .. })
    }
}

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;
