//! # Event-Source Registry
//!
//! Tracks topics that receive messages from an external one-shot event
//! source (for example a storage-bucket notification). Such a source can
//! only target the topic's primary queue, so subscriptions bound to the
//! primary re-send what they receive to every replica.
//!
//! The flag lives in memory and is mirrored as a tag on the primary queue.
//! [`EventSourceRegistry::recover`] rebuilds the in-memory set from those
//! tags once at startup.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::naming::{is_replica_name, validate_topic_name};
use super::shutdown::ShutdownSignal;
use super::topology::TopologyManager;
use crate::config::PubSubConfig;
use crate::constants::tags::USED_ON_EVENT_VALUE;
use crate::error::{PubSubError, PubSubResult};
use crate::messaging::QueueId;

#[derive(Debug)]
pub struct EventSourceRegistry {
    topology: Arc<TopologyManager>,
    topics: Mutex<HashSet<String>>,
    tag_key: String,
    shutdown: ShutdownSignal,
}

impl EventSourceRegistry {
    pub fn new(
        topology: Arc<TopologyManager>,
        config: &PubSubConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            topology,
            topics: Mutex::new(HashSet::new()),
            tag_key: config.event_source_tag_key.clone(),
            shutdown,
        }
    }

    /// Rebuild the flagged-topic set from backend tags
    ///
    /// Scans every queue, skips replica-named queues, and records each
    /// tagged primary. Returns the number of recovered topics.
    pub async fn recover(&self) -> PubSubResult<usize> {
        let backend = self.topology.backend();
        let retry = self.topology.retry_policy();

        let queues = retry
            .call("recover_list_queues", &self.shutdown, || async move {
                Ok(backend.list_all_queues("").await?)
            })
            .await?;

        let mut recovered = HashSet::new();
        for queue in queues.iter().filter(|queue| !is_replica_name(queue.name())) {
            let tags = retry
                .call("recover_list_queue_tags", &self.shutdown, || async move {
                    Ok(backend.list_queue_tags(queue).await?)
                })
                .await;

            match tags {
                Ok(tags) if tags.contains_key(&self.tag_key) => {
                    recovered.insert(queue.name().to_string());
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    debug!(queue = %queue, "Queue vanished during event-source recovery");
                }
                Err(err) => return Err(err),
            }
        }

        let count = recovered.len();
        self.topics.lock().extend(recovered);
        info!(
            recovered_topics = count,
            scanned_queues = queues.len(),
            "🔁 Event-source flags recovered from queue tags"
        );
        Ok(count)
    }

    /// Flag `topic` as the target of an external event source
    ///
    /// The in-memory set is updated first and is not rolled back if tagging
    /// the primary queue fails.
    pub async fn mark_used_on_event(&self, topic: &str) -> PubSubResult<()> {
        validate_topic_name(topic)?;
        self.topics.lock().insert(topic.to_string());

        let result = async {
            let primary = self.primary_for_marking(topic).await?;
            let primary = &primary;
            let backend = self.topology.backend();
            let tag_key = self.tag_key.as_str();
            self.topology
                .retry_policy()
                .call("tag_queue", &self.shutdown, || async move {
                    Ok(backend
                        .tag_queue(primary, tag_key, USED_ON_EVENT_VALUE)
                        .await?)
                })
                .await
        }
        .await;

        if let Err(err) = &result {
            warn!(
                topic = %topic,
                error = %err,
                "⚠️ Topic flagged in memory but tagging the primary queue failed"
            );
        }
        result
    }

    /// Clear the event-source flag of `topic`
    ///
    /// A topic without a primary queue has no tag to remove.
    pub async fn unmark_used_on_event(&self, topic: &str) -> PubSubResult<()> {
        self.topics.lock().remove(topic);

        let primary = match self.topology.primary_queue(topic).await {
            Ok(primary) => primary,
            Err(PubSubError::TopicNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };

        let primary = &primary;
        let backend = self.topology.backend();
        let tag_key = self.tag_key.as_str();
        let result = self
            .topology
            .retry_policy()
            .call("untag_queue", &self.shutdown, || async move {
                Ok(backend.untag_queue(primary, tag_key).await?)
            })
            .await;

        match result {
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                warn!(
                    topic = %topic,
                    error = %err,
                    "⚠️ Topic unflagged in memory but untagging the primary queue failed"
                );
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Flagged topics, from memory only
    pub fn list_topics_used_on_event(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_used_on_event(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    /// Drop the in-memory flag without touching backend tags
    pub fn forget(&self, topic: &str) {
        self.topics.lock().remove(topic);
    }

    pub fn clear(&self) {
        self.topics.lock().clear();
    }

    async fn primary_for_marking(&self, topic: &str) -> PubSubResult<QueueId> {
        self.topology
            .ensure_topic_exists(topic, false)
            .await?
            .into_iter()
            .find(|queue| queue.name() == topic)
            .ok_or_else(|| PubSubError::topic_not_found(topic))
    }
}
