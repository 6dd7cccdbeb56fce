//! # Topology Cache
//!
//! Time-bounded, read-through view of topic → queue set. Entries older than
//! the staleness bound are treated as absent (and evicted on read), forcing
//! the caller to rediscover the topology from the backend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::messaging::QueueId;

#[derive(Debug, Clone)]
struct CacheEntry {
    queues: Vec<QueueId>,
    captured_at: Instant,
}

/// Topic → ordered queue set, trusted only for `ttl`
#[derive(Debug)]
pub struct TopologyCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl TopologyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh queue set for `topic`, if one was captured within the staleness bound
    pub fn get(&self, topic: &str) -> Option<Vec<QueueId>> {
        let mut entries = self.entries.lock();
        match entries.get(topic) {
            Some(entry) if entry.captured_at.elapsed() < self.ttl => Some(entry.queues.clone()),
            Some(_) => {
                entries.remove(topic);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, topic: &str, queues: Vec<QueueId>) {
        self.entries.lock().insert(
            topic.to_string(),
            CacheEntry {
                queues,
                captured_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, topic: &str) {
        self.entries.lock().remove(topic);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
