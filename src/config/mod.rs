//! # Fan-out Configuration System
//!
//! Runtime configuration for the pub/sub emulation layer: topology cache
//! staleness, retry/backoff policy, long-poll parameters and shutdown
//! behaviour.
//!
//! ## Architecture
//!
//! - **Layered Sources**: defaults, then an optional config file, then
//!   `FANOUT_`-prefixed environment variables
//! - **Environment Awareness**: `fanout-{environment}` overrides `fanout`
//! - **Explicit Validation**: out-of-range values are rejected at load time
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fanout_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let ttl = manager.config().topology_cache_ttl();
//! let backoff = manager.config().retry_backoff();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{defaults, tags};
use crate::error::{PubSubError, PubSubResult};

pub use loader::ConfigManager;

/// Root configuration for [`QueuePubSub`](crate::pubsub::QueuePubSub)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Staleness bound of a topology cache entry
    pub topology_cache_ttl_ms: u64,

    /// Fixed interval between attempts of a throttled operation
    pub retry_backoff_ms: u64,

    /// Attempt ceiling for throttled operations; `None` retries forever
    pub max_retry_attempts: Option<u32>,

    pub receive_batch_size: u32,

    /// Long-poll wait per receive call (1 to 20 seconds)
    pub receive_wait_seconds: u32,

    /// Lease on received messages before they become visible again
    pub visibility_timeout_seconds: u32,

    /// Self-healing pause after an unexpected polling error
    pub poll_error_backoff_ms: u64,

    /// Authorize the external event source on every newly created queue
    pub grant_external_publish: bool,

    /// Tag key that persists the event-source flag on primary queues
    pub event_source_tag_key: String,

    /// How long topic deletion and shutdown wait for polling loops to stop
    pub shutdown_timeout_ms: u64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            topology_cache_ttl_ms: defaults::TOPOLOGY_CACHE_TTL_MS,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            max_retry_attempts: Some(defaults::MAX_RETRY_ATTEMPTS),
            receive_batch_size: defaults::RECEIVE_BATCH_SIZE,
            receive_wait_seconds: defaults::RECEIVE_WAIT_SECONDS,
            visibility_timeout_seconds: defaults::VISIBILITY_TIMEOUT_SECONDS,
            poll_error_backoff_ms: defaults::POLL_ERROR_BACKOFF_MS,
            grant_external_publish: true,
            event_source_tag_key: tags::USED_ON_EVENT_KEY.to_string(),
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl PubSubConfig {
    pub fn topology_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.topology_cache_ttl_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_error_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate value ranges
    pub fn validate(&self) -> PubSubResult<()> {
        if self.topology_cache_ttl_ms == 0 {
            return Err(PubSubError::configuration(
                "topology_cache_ttl_ms",
                "must be greater than zero",
            ));
        }

        if self.receive_batch_size == 0
            || self.receive_batch_size > defaults::MAX_RECEIVE_BATCH_SIZE
        {
            return Err(PubSubError::configuration(
                "receive_batch_size",
                format!(
                    "must be between 1 and {}, got {}",
                    defaults::MAX_RECEIVE_BATCH_SIZE,
                    self.receive_batch_size
                ),
            ));
        }

        if self.receive_wait_seconds == 0
            || self.receive_wait_seconds > defaults::MAX_RECEIVE_WAIT_SECONDS
        {
            return Err(PubSubError::configuration(
                "receive_wait_seconds",
                format!(
                    "must be between 1 and {}, got {}",
                    defaults::MAX_RECEIVE_WAIT_SECONDS,
                    self.receive_wait_seconds
                ),
            ));
        }

        if self.visibility_timeout_seconds == 0 {
            return Err(PubSubError::configuration(
                "visibility_timeout_seconds",
                "must be greater than zero",
            ));
        }

        if self.max_retry_attempts == Some(0) {
            return Err(PubSubError::configuration(
                "max_retry_attempts",
                "must allow at least one attempt",
            ));
        }

        if self.event_source_tag_key.trim().is_empty() {
            return Err(PubSubError::configuration(
                "event_source_tag_key",
                "must not be empty",
            ));
        }

        Ok(())
    }

    /// JSON rendering for startup logging
    pub fn debug_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
