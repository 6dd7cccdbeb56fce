//! # System Constants
//!
//! Naming, tagging and timing constants that define the operational
//! boundaries of the fan-out layer. Runtime-tunable values have matching
//! fields in [`PubSubConfig`](crate::config::PubSubConfig); the constants
//! here are their defaults.

/// Queue naming
pub mod naming {
    /// Separator between a topic name and a replica suffix
    pub const REPLICA_SEPARATOR: &str = "-replica-";

    /// Length of the random replica suffix (simple-format UUID)
    pub const REPLICA_SUFFIX_LEN: usize = 32;

    /// Longest queue name most managed queue services accept
    pub const MAX_QUEUE_NAME_LEN: usize = 80;

    /// Longest topic name that still leaves room for a replica suffix
    pub const MAX_TOPIC_NAME_LEN: usize =
        MAX_QUEUE_NAME_LEN - REPLICA_SEPARATOR.len() - REPLICA_SUFFIX_LEN;
}

/// Backend metadata
pub mod tags {
    /// Tag marking a primary queue as the target of an external event source
    pub const USED_ON_EVENT_KEY: &str = "fanout-used-on-event";

    pub const USED_ON_EVENT_VALUE: &str = "true";
}

/// Default timings and limits
pub mod defaults {
    /// Staleness bound of a topology cache entry
    pub const TOPOLOGY_CACHE_TTL_MS: u64 = 5_000;

    /// Fixed wait before retrying a throttled operation
    pub const RETRY_BACKOFF_MS: u64 = 1_000;

    pub const MAX_RETRY_ATTEMPTS: u32 = 30;

    pub const RECEIVE_BATCH_SIZE: u32 = 10;

    /// Upper limit on receive batch size accepted by managed queue services
    pub const MAX_RECEIVE_BATCH_SIZE: u32 = 10;

    pub const RECEIVE_WAIT_SECONDS: u32 = 20;

    /// Upper limit on long-poll wait accepted by managed queue services
    pub const MAX_RECEIVE_WAIT_SECONDS: u32 = 20;

    pub const VISIBILITY_TIMEOUT_SECONDS: u32 = 30;

    /// Pause after an unexpected polling error before polling again
    pub const POLL_ERROR_BACKOFF_MS: u64 = 1_000;

    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
}
