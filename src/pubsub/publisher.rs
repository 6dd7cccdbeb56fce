//! # Fan-out Publisher
//!
//! Emulates multicast on a unicast backend: a published message is
//! enqueued into every queue backing the topic, concurrently. Publish
//! succeeds only when every send succeeds. A throttled send re-runs the
//! whole publish, so every queue may receive the message more than once.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info};

use super::naming::validate_topic_name;
use super::retry::RetryPolicy;
use super::shutdown::ShutdownSignal;
use super::topology::TopologyManager;
use crate::error::{PubSubError, PubSubResult};
use crate::messaging::{BackendError, QueueId};

#[derive(Debug)]
pub struct FanoutPublisher {
    topology: Arc<TopologyManager>,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl FanoutPublisher {
    pub fn new(topology: Arc<TopologyManager>, shutdown: ShutdownSignal) -> Self {
        Self {
            retry: topology.retry_policy().clone(),
            topology,
            shutdown,
        }
    }

    /// Enqueue `message` into every queue of `topic`
    ///
    /// Creates the primary queue when the topic has none. Returns the number
    /// of queues the message was delivered to.
    pub async fn publish(&self, topic: &str, message: &str) -> PubSubResult<usize> {
        validate_topic_name(topic)?;
        let delivered = self
            .retry
            .call("publish", &self.shutdown, || self.publish_once(topic, message))
            .await?;

        info!(topic = %topic, queue_count = delivered, "📤 Fan-out publish complete");
        Ok(delivered)
    }

    async fn publish_once(&self, topic: &str, message: &str) -> PubSubResult<usize> {
        let queues = self.topology.ensure_once(topic, false).await?;
        let backend = self.topology.backend();

        debug!(topic = %topic, queue_count = queues.len(), "📤 Fan-out publish");
        let sends = queues
            .iter()
            .map(|queue| async move { (queue, backend.send_message(queue, message).await) });
        let results = join_all(sends).await;

        let mut delivered = 0;
        let mut throttled: Option<BackendError> = None;
        let mut failure: Option<PubSubError> = None;

        for (queue, result) in results {
            match result {
                Ok(_) => delivered += 1,
                Err(err) if err.is_throttled() => {
                    throttled.get_or_insert(err);
                }
                Err(err) if err.is_not_found() => {
                    self.topology.forget_queue(topic, queue);
                    if is_primary(topic, queue) {
                        failure.get_or_insert(err.into());
                    } else {
                        debug!(topic = %topic, queue = %queue, "Replica vanished during publish");
                    }
                }
                Err(err) => {
                    failure.get_or_insert(err.into());
                }
            }
        }

        match (failure, throttled) {
            (Some(err), _) => Err(err),
            (None, Some(err)) => Err(err.into()),
            (None, None) => Ok(delivered),
        }
    }
}

fn is_primary(topic: &str, queue: &QueueId) -> bool {
    queue.name() == topic
}
