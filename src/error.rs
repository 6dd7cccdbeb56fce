//! # Pub/Sub Error Types
//!
//! Error taxonomy of the fan-out layer:
//!
//! - **Throttled**: transient, retried through the fixed-backoff [`RetryPolicy`](crate::pubsub::RetryPolicy)
//! - **Permission/Configuration**: fatal to the current operation, never retried
//! - **NotFound/AlreadyGone**: benign, a polling loop treats it as a clean stop
//! - **Handler**: caller handler failures, reported through the error callback
//! - **Cancelled**: expected during shutdown, never reported as a failure

use crate::messaging::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Permission error for topic {topic}: {message}")]
    Permission { topic: String, message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Invalid topic name: {topic}: {reason}")]
    InvalidTopicName { topic: String, reason: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Message handler failed for topic {topic} (message {message_id}): {source}")]
    Handler {
        topic: String,
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Operation {operation} still throttled after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: BackendError,
    },
}

impl PubSubError {
    /// Create a permission error
    pub fn permission(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permission {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an invalid topic name error
    pub fn invalid_topic_name(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTopicName {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create a topic not found error
    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    /// Wrap a failure raised by a caller-supplied handler
    pub fn handler(
        topic: impl Into<String>,
        message_id: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::Handler {
            topic: topic.into(),
            message_id: message_id.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Backend throttling that a caller may retry
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_throttled())
    }

    /// The backing queue or topic is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_not_found(),
            Self::TopicNotFound { .. } => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<config::ConfigError> for PubSubError {
    fn from(err: config::ConfigError) -> Self {
        PubSubError::configuration("config", err.to_string())
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        PubSubError::configuration("serialization", err.to_string())
    }
}

/// Result type alias for pub/sub operations
pub type PubSubResult<T> = Result<T, PubSubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_through_backend_errors() {
        let throttled: PubSubError = BackendError::throttled("send_message", "slow down").into();
        assert!(throttled.is_throttled());
        assert!(!throttled.is_not_found());

        let gone: PubSubError = BackendError::queue_not_found("orders").into();
        assert!(gone.is_not_found());
        assert!(PubSubError::topic_not_found("orders").is_not_found());

        assert!(PubSubError::cancelled("publish").is_cancelled());
        assert!(!PubSubError::permission("orders", "denied").is_throttled());
    }

    #[test]
    fn test_error_display() {
        let err = PubSubError::handler("orders", "m-1", anyhow::anyhow!("boom"));
        let display_str = format!("{err}");
        assert!(display_str.contains("orders"));
        assert!(display_str.contains("m-1"));
        assert!(display_str.contains("boom"));

        let err = PubSubError::RetryExhausted {
            operation: "publish".to_string(),
            attempts: 3,
            last_error: BackendError::throttled("send_message", "rate exceeded"),
        };
        let display_str = format!("{err}");
        assert!(display_str.contains("publish"));
        assert!(display_str.contains("3 attempts"));
    }
}
