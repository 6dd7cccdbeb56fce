//! # Topology Manager
//!
//! Owns the topic → queue-set mapping. A topic is realised by one primary
//! queue (named after the topic) plus one replica queue per additional
//! subscriber. The manager creates queues, authorizes the external event
//! source on them, and discovers queues created by other processes through
//! the time-bounded [`TopologyCache`].
//!
//! A successful backend listing is authoritative: queues deleted elsewhere
//! disappear from the set on the next discovery. Queues this instance
//! created are kept for one cache TTL even when a listing does not show
//! them yet.
//!
//! Queue creation is serialized per topic within one process, so two local
//! subscribers never end up bound to the same queue. Concurrent ensures in
//! *different* processes may still both create a replica. This is
//! tolerated: the extra replica receives fan-out copies until its topic is
//! deleted.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::naming::{queue_belongs_to_topic, replica_queue_name, validate_topic_name};
use super::retry::RetryPolicy;
use super::shutdown::ShutdownSignal;
use super::topology_cache::TopologyCache;
use crate::config::PubSubConfig;
use crate::error::{PubSubError, PubSubResult};
use crate::messaging::{BackendError, QueueBackend, QueueId};

#[derive(Debug, Clone)]
struct KnownQueue {
    id: QueueId,
    /// Set when created locally, cleared once a backend listing shows the queue
    unlisted_since: Option<Instant>,
}

pub struct TopologyManager {
    backend: Arc<dyn QueueBackend>,
    topics: Mutex<HashMap<String, Vec<KnownQueue>>>,
    unpolled_primaries: Mutex<HashMap<String, QueueId>>,
    allocation_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    cache: TopologyCache,
    retry: RetryPolicy,
    grant_external_publish: bool,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("backend", &self.backend.backend_type())
            .field("topic_count", &self.topics.lock().len())
            .field("cache_ttl", &self.cache.ttl())
            .field("retry", &self.retry)
            .field("grant_external_publish", &self.grant_external_publish)
            .finish()
    }
}

impl TopologyManager {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        config: &PubSubConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            backend,
            topics: Mutex::new(HashMap::new()),
            unpolled_primaries: Mutex::new(HashMap::new()),
            allocation_locks: DashMap::new(),
            cache: TopologyCache::new(config.topology_cache_ttl()),
            retry: RetryPolicy::from_config(config),
            grant_external_publish: config.grant_external_publish,
            shutdown,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Ensure `topic` is backed by at least one queue
    ///
    /// With `force_new_queue == false` an existing queue set is returned
    /// unchanged. Otherwise exactly one queue is created: the primary if
    /// none exists yet, a replica if one does. Throttling retries the whole
    /// operation.
    pub async fn ensure_topic_exists(
        &self,
        topic: &str,
        force_new_queue: bool,
    ) -> PubSubResult<Vec<QueueId>> {
        validate_topic_name(topic)?;
        self.retry
            .call("ensure_topic_exists", &self.shutdown, || {
                self.ensure_once(topic, force_new_queue)
            })
            .await
    }

    /// Create the dedicated queue for a new subscriber and return it
    ///
    /// The first subscriber of a topic gets the primary queue, every later
    /// one a fresh replica.
    pub async fn allocate_subscriber_queue(&self, topic: &str) -> PubSubResult<QueueId> {
        validate_topic_name(topic)?;
        self.retry
            .call("allocate_subscriber_queue", &self.shutdown, || async move {
                let _guard = self.lock_allocation(topic).await;
                let existing = self.resolve(topic).await?;
                let (queue, _) = self.add_queue(topic, &existing).await?;
                Ok(queue)
            })
            .await
    }

    /// Single, non-retried ensure attempt
    ///
    /// A primary created here has no subscriber yet and is remembered until
    /// claimed through [`take_unpolled_primary`](Self::take_unpolled_primary).
    pub(crate) async fn ensure_once(
        &self,
        topic: &str,
        force_new_queue: bool,
    ) -> PubSubResult<Vec<QueueId>> {
        if !force_new_queue {
            let existing = self.resolve(topic).await?;
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        let _guard = self.lock_allocation(topic).await;
        let existing = self.resolve(topic).await?;
        if !force_new_queue && !existing.is_empty() {
            return Ok(existing);
        }

        let (queue, queues) = self.add_queue(topic, &existing).await?;
        if queue.name() == topic {
            self.unpolled_primaries
                .lock()
                .insert(topic.to_string(), queue);
        }
        Ok(queues)
    }

    /// Primary queue this instance created without binding a subscriber to it
    pub fn take_unpolled_primary(&self, topic: &str) -> Option<QueueId> {
        self.unpolled_primaries.lock().remove(topic)
    }

    /// Hand a primary back after its last local consumer stopped
    pub fn release_primary(&self, topic: &str, queue: QueueId) {
        self.unpolled_primaries
            .lock()
            .insert(topic.to_string(), queue);
    }

    async fn lock_allocation(&self, topic: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .allocation_locks
            .entry(topic.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Create one queue: the primary when `existing` is empty, a replica otherwise
    async fn add_queue(
        &self,
        topic: &str,
        existing: &[QueueId],
    ) -> PubSubResult<(QueueId, Vec<QueueId>)> {
        let name = if existing.is_empty() {
            topic.to_string()
        } else {
            replica_queue_name(topic)
        };

        debug!(topic = %topic, queue = %name, "📋 Creating queue for topic");
        let queue = match self.backend.create_queue(&name).await {
            Ok(queue) => queue,
            Err(BackendError::QueueAlreadyExists { .. }) => self.existing_queue(&name).await?,
            Err(err) => return Err(err.into()),
        };

        if self.grant_external_publish {
            if let Err(err) = self.backend.grant_external_publish_permission(&queue).await {
                self.discard_unauthorized_queue(topic, &queue).await;
                return Err(match err {
                    BackendError::Throttled { .. } => err.into(),
                    other => PubSubError::permission(topic, other.to_string()),
                });
            }
        }

        let queues = self.record_queue(topic, queue.clone());
        info!(
            topic = %topic,
            queue = %queue,
            queue_count = queues.len(),
            primary = queue.name() == topic,
            "✅ Queue added to topic"
        );
        Ok((queue, queues))
    }

    /// Handle of a queue the backend reported as already existing
    async fn existing_queue(&self, name: &str) -> PubSubResult<QueueId> {
        debug!(queue = %name, "Queue already exists, looking up its handle");
        self.backend
            .list_all_queues(name)
            .await?
            .into_iter()
            .find(|queue| queue.name() == name)
            .ok_or_else(|| {
                PubSubError::Backend(BackendError::queue_operation(
                    name,
                    "create_queue",
                    "reported as existing but absent from queue listing",
                ))
            })
    }

    /// Current queue set for `topic`, rediscovered from the backend when the cache is stale
    pub async fn resolve(&self, topic: &str) -> PubSubResult<Vec<QueueId>> {
        if let Some(queues) = self.cache.get(topic) {
            return Ok(queues);
        }

        let listed: Vec<QueueId> = self
            .backend
            .list_all_queues(topic)
            .await?
            .into_iter()
            .filter(|queue| queue_belongs_to_topic(queue.name(), topic))
            .collect();

        let grace = self.cache.ttl();
        let (queues, dropped) = {
            let mut topics = self.topics.lock();
            let mut merged: Vec<KnownQueue> = listed
                .into_iter()
                .map(|id| KnownQueue {
                    id,
                    unlisted_since: None,
                })
                .collect();
            let mut dropped = Vec::new();

            for local in topics.remove(topic).unwrap_or_default() {
                if merged.iter().any(|known| known.id == local.id) {
                    continue;
                }
                match local.unlisted_since {
                    Some(since) if since.elapsed() < grace => merged.push(local),
                    _ => dropped.push(local.id),
                }
            }

            order_primary_first(topic, &mut merged);
            let queues: Vec<QueueId> = merged.iter().map(|known| known.id.clone()).collect();
            if !merged.is_empty() {
                topics.insert(topic.to_string(), merged);
            }
            (queues, dropped)
        };

        if !dropped.is_empty() {
            info!(
                topic = %topic,
                dropped = dropped.len(),
                "🧹 Queues deleted elsewhere removed from topic"
            );
            let mut unpolled = self.unpolled_primaries.lock();
            if dropped.iter().any(|queue| queue.name() == topic) {
                unpolled.remove(topic);
            }
        }

        debug!(topic = %topic, queue_count = queues.len(), "🔍 Topic topology discovered");
        self.cache.insert(topic, queues.clone());
        Ok(queues)
    }

    /// Bypass the cache and rediscover the topic's queues
    pub async fn resolve_fresh(&self, topic: &str) -> PubSubResult<Vec<QueueId>> {
        self.cache.invalidate(topic);
        self.resolve(topic).await
    }

    /// Primary queue of an existing topic
    pub async fn primary_queue(&self, topic: &str) -> PubSubResult<QueueId> {
        self.resolve(topic)
            .await?
            .into_iter()
            .find(|queue| queue.name() == topic)
            .ok_or_else(|| PubSubError::topic_not_found(topic))
    }

    /// Drop every trace of `topic`, returning the queues that were known locally
    pub fn forget_topic(&self, topic: &str) -> Vec<QueueId> {
        self.cache.invalidate(topic);
        self.unpolled_primaries.lock().remove(topic);
        self.topics
            .lock()
            .remove(topic)
            .unwrap_or_default()
            .into_iter()
            .map(|known| known.id)
            .collect()
    }

    /// Remove a single queue from the topic's set
    pub fn forget_queue(&self, topic: &str, queue: &QueueId) {
        {
            let mut topics = self.topics.lock();
            if let Some(known) = topics.get_mut(topic) {
                known.retain(|existing| existing.id != *queue);
                if known.is_empty() {
                    topics.remove(topic);
                }
            }
        }
        self.cache.invalidate(topic);
    }

    /// Topics with locally known queues
    pub fn known_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn clear(&self) {
        self.topics.lock().clear();
        self.unpolled_primaries.lock().clear();
        self.allocation_locks.clear();
        self.cache.clear();
    }

    fn record_queue(&self, topic: &str, queue: QueueId) -> Vec<QueueId> {
        let queues = {
            let mut topics = self.topics.lock();
            let known = topics.entry(topic.to_string()).or_default();
            if !known.iter().any(|existing| existing.id == queue) {
                known.push(KnownQueue {
                    id: queue,
                    unlisted_since: Some(Instant::now()),
                });
            }
            order_primary_first(topic, known.as_mut_slice());
            known.iter().map(|existing| existing.id.clone()).collect::<Vec<_>>()
        };
        self.cache.insert(topic, queues.clone());
        queues
    }

    /// Best-effort removal of a replica the event source could not be authorized on
    async fn discard_unauthorized_queue(&self, topic: &str, queue: &QueueId) {
        if queue.name() == topic {
            return;
        }
        if let Err(err) = self.backend.delete_queue(queue).await {
            warn!(
                topic = %topic,
                queue = %queue,
                error = %err,
                "Failed to remove replica after permission grant failure"
            );
        }
    }
}

fn order_primary_first(topic: &str, queues: &mut [KnownQueue]) {
    queues.sort_by_key(|queue| queue.id.name() != topic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryQueueBackend;
    use crate::pubsub::naming::replica_parent;
    use std::time::Duration;

    fn manager_with(backend: Arc<InMemoryQueueBackend>, config: PubSubConfig) -> TopologyManager {
        TopologyManager::new(backend, &config, ShutdownSignal::new())
    }

    fn fast_config() -> PubSubConfig {
        PubSubConfig {
            retry_backoff_ms: 5,
            ..PubSubConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_queue_is_primary_and_ensure_is_idempotent() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());

        let first = manager.ensure_topic_exists("orders", false).await.unwrap();
        let second = manager.ensure_topic_exists("orders", false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name(), "orders");
        assert!(backend.has_external_publish_grant("orders").await);
    }

    #[tokio::test]
    async fn test_forced_queues_become_replicas() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());

        manager.ensure_topic_exists("orders", true).await.unwrap();
        manager.ensure_topic_exists("orders", true).await.unwrap();
        let queues = manager.ensure_topic_exists("orders", true).await.unwrap();

        assert_eq!(queues.len(), 3);
        assert_eq!(queues[0].name(), "orders");
        for replica in &queues[1..] {
            assert_eq!(replica_parent(replica.name()), Some("orders"));
        }
        assert_ne!(queues[1], queues[2]);
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_a_distinct_queue() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());

        let first = manager.allocate_subscriber_queue("orders").await.unwrap();
        let second = manager.allocate_subscriber_queue("orders").await.unwrap();
        let third = manager.allocate_subscriber_queue("orders").await.unwrap();

        assert_eq!(first.name(), "orders");
        assert_eq!(replica_parent(second.name()), Some("orders"));
        assert_ne!(second, third);
        assert_eq!(manager.resolve("orders").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_share_a_queue() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        backend.set_latency(Duration::from_millis(20));
        let manager = manager_with(backend.clone(), fast_config());

        let (first, second) = tokio::join!(
            manager.allocate_subscriber_queue("orders"),
            manager.allocate_subscriber_queue("orders")
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_ne!(first, second);
        let names = [first.name(), second.name()];
        assert!(names.contains(&"orders"));
        assert_eq!(backend.queue_names().await.len(), 2);
    }

    #[tokio::test]
    async fn test_allocation_claims_nothing_from_unpolled_set() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());

        manager.ensure_topic_exists("orders", false).await.unwrap();
        assert_eq!(
            manager.take_unpolled_primary("orders").map(|q| q.name().to_string()),
            Some("orders".to_string())
        );
        assert_eq!(manager.take_unpolled_primary("orders"), None);

        manager.allocate_subscriber_queue("payments").await.unwrap();
        assert_eq!(manager.take_unpolled_primary("payments"), None);
    }

    #[tokio::test]
    async fn test_discovers_queues_created_by_other_instances() {
        let backend = Arc::new(InMemoryQueueBackend::with_page_size(1));
        let other = manager_with(backend.clone(), fast_config());
        other.ensure_topic_exists("orders", true).await.unwrap();
        other.ensure_topic_exists("orders", true).await.unwrap();
        other.ensure_topic_exists("orders-eu", true).await.unwrap();

        let manager = manager_with(backend.clone(), fast_config());
        let queues = manager.ensure_topic_exists("orders", false).await.unwrap();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].name(), "orders");
    }

    #[tokio::test]
    async fn test_queues_deleted_elsewhere_drop_out_after_staleness() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let config = PubSubConfig {
            topology_cache_ttl_ms: 50,
            ..fast_config()
        };
        let manager = manager_with(backend.clone(), config.clone());
        manager.ensure_topic_exists("orders", true).await.unwrap();
        let queues = manager.ensure_topic_exists("orders", true).await.unwrap();

        let other = manager_with(backend.clone(), config);
        other.resolve("orders").await.unwrap();
        backend.delete_queue(&queues[1]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.resolve("orders").await.unwrap(), vec![queues[0].clone()]);
        assert_eq!(other.resolve("orders").await.unwrap(), vec![queues[0].clone()]);
    }

    #[tokio::test]
    async fn test_existing_name_reported_by_backend_counts_as_created() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());
        backend.create_queue("orders").await.unwrap();
        backend.reject_existing_creates(true);

        // Skips discovery, as when a listing lags behind a concurrent create.
        let (queue, queues) = manager.add_queue("orders", &[]).await.unwrap();

        assert_eq!(queue, InMemoryQueueBackend::queue_url("orders"));
        assert_eq!(queues, vec![queue]);
        assert!(backend.has_external_publish_grant("orders").await);
    }

    #[tokio::test]
    async fn test_throttled_creation_is_retried() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());

        backend.throttle_next(2);
        let queues = manager.ensure_topic_exists("orders", false).await.unwrap();
        assert_eq!(queues.len(), 1);
    }

    #[tokio::test]
    async fn test_permission_failure_fails_ensure_without_recording() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());
        manager.ensure_topic_exists("orders", false).await.unwrap();

        backend.deny_permission_grants(true);
        let err = manager.ensure_topic_exists("orders", true).await.unwrap_err();
        assert!(matches!(err, PubSubError::Permission { .. }));

        let queues = manager.resolve_fresh("orders").await.unwrap();
        assert_eq!(queues.len(), 1, "unauthorized replica must not join the topic");
        assert_eq!(backend.queue_names().await, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_grant_can_be_disabled() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(
            backend.clone(),
            PubSubConfig {
                grant_external_publish: false,
                ..fast_config()
            },
        );
        manager.ensure_topic_exists("orders", false).await.unwrap();
        assert!(!backend.has_external_publish_grant("orders").await);
    }

    #[tokio::test]
    async fn test_invalid_topic_is_rejected_before_backend_calls() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());
        let err = manager.ensure_topic_exists("bad name", false).await.unwrap_err();
        assert!(matches!(err, PubSubError::InvalidTopicName { .. }));
        assert!(backend.queue_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_topic_clears_map_and_cache() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let manager = manager_with(backend.clone(), fast_config());
        manager.ensure_topic_exists("orders", true).await.unwrap();
        manager.ensure_topic_exists("orders", true).await.unwrap();

        let forgotten = manager.forget_topic("orders");
        assert_eq!(forgotten.len(), 2);
        assert!(manager.known_topics().is_empty());
        assert_eq!(manager.take_unpolled_primary("orders"), None);
    }
}
