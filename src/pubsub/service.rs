//! # Queue Pub/Sub Service
//!
//! Public entry point of the crate. Wires the topology manager, fan-out
//! publisher, event-source registry and subscription runtime around one
//! [`QueueBackend`] and exposes topic semantics on top of it.
//!
//! A primary queue this instance created without binding a subscriber to it
//! (through publish, ensure or flagging), or whose subscriber left, is
//! unclaimed. While the topic is event-sourced, an unclaimed primary is
//! drained by a relay that forwards what the external source delivers to the
//! subscribers' queues.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fanout_core::config::PubSubConfig;
//! use fanout_core::messaging::InMemoryQueueBackend;
//! use fanout_core::pubsub::{ignore_errors, QueuePubSub};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(InMemoryQueueBackend::new());
//! let pubsub = QueuePubSub::new(backend, PubSubConfig::default()).await?;
//!
//! pubsub
//!     .subscribe(
//!         "orders",
//!         |_topic: String, message: String| async move {
//!             println!("received {message}");
//!             Ok(())
//!         },
//!         ignore_errors(),
//!     )
//!     .await?;
//!
//! pubsub.publish("orders", "order-created").await?;
//! pubsub.shutdown().await;
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_source::EventSourceRegistry;
use super::handler::{ignore_errors, ErrorCallback, MessageHandler};
use super::publisher::FanoutPublisher;
use super::shutdown::ShutdownSignal;
use super::subscription::{SubscriptionHandle, SubscriptionPoller, SubscriptionState};
use super::topology::TopologyManager;
use crate::config::PubSubConfig;
use crate::error::{PubSubError, PubSubResult};
use crate::logging::{log_error, log_subscription_operation, log_topic_operation};
use crate::messaging::{QueueBackend, QueueId};

/// Topic-level publish/subscribe over a point-to-point queue backend
pub struct QueuePubSub {
    config: PubSubConfig,
    backend: Arc<dyn QueueBackend>,
    topology: Arc<TopologyManager>,
    events: Arc<EventSourceRegistry>,
    publisher: FanoutPublisher,
    subscriptions: DashMap<String, Vec<Arc<SubscriptionHandle>>>,
    relays: DashMap<String, Arc<SubscriptionHandle>>,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for QueuePubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePubSub")
            .field("backend", &self.backend.backend_type())
            .field("topology", &self.topology)
            .field("subscribed_topics", &self.subscriptions.len())
            .field("relays", &self.relays.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl QueuePubSub {
    /// Build the service and recover event-source flags from backend tags
    pub async fn new(backend: Arc<dyn QueueBackend>, config: PubSubConfig) -> PubSubResult<Self> {
        config.validate()?;

        let shutdown = ShutdownSignal::new();
        let topology = Arc::new(TopologyManager::new(
            backend.clone(),
            &config,
            shutdown.clone(),
        ));
        let events = Arc::new(EventSourceRegistry::new(
            topology.clone(),
            &config,
            shutdown.clone(),
        ));
        let publisher = FanoutPublisher::new(topology.clone(), shutdown.clone());

        let recovered = events.recover().await?;
        info!(
            backend = backend.backend_type(),
            recovered_event_topics = recovered,
            cache_ttl_ms = config.topology_cache_ttl_ms,
            "🚀 Queue pub/sub service started"
        );

        Ok(Self {
            config,
            backend,
            topology,
            events,
            publisher,
            subscriptions: DashMap::new(),
            relays: DashMap::new(),
            shutdown,
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    /// Ensure `topic` is backed by at least one queue, optionally adding one
    pub async fn ensure_topic_exists(
        &self,
        topic: &str,
        force_new_queue: bool,
    ) -> PubSubResult<Vec<QueueId>> {
        let queues = self.topology.ensure_topic_exists(topic, force_new_queue).await?;
        self.adopt_primary(topic);
        log_topic_operation(
            "ensure_topic_exists",
            topic,
            Some(queues.len()),
            "ready",
            force_new_queue.then_some("forced new queue"),
        );
        Ok(queues)
    }

    /// Deliver `message` to every queue of `topic`, returning the queue count
    pub async fn publish(&self, topic: &str, message: &str) -> PubSubResult<usize> {
        let delivered = self.publisher.publish(topic, message).await?;
        self.adopt_primary(topic);
        Ok(delivered)
    }

    /// Register a subscriber on its own new queue and start its polling loop
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        on_error: ErrorCallback,
    ) -> PubSubResult<Arc<SubscriptionHandle>>
    where
        H: MessageHandler + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(PubSubError::cancelled("subscribe"));
        }

        let queue = self.topology.allocate_subscriber_queue(topic).await?;
        let poller = SubscriptionPoller::new(
            topic,
            queue,
            self.topology.clone(),
            self.events.clone(),
            Arc::new(handler),
            on_error,
            &self.config,
        );
        let handle = poller.spawn();
        self.register(topic, &handle)?;

        log_subscription_operation(
            "subscribe",
            topic,
            &handle.id().to_string(),
            Some(handle.queue_id().as_str()),
            if handle.is_primary() { "primary" } else { "replica" },
        );
        Ok(handle)
    }

    /// Stop one subscription and remove its dedicated queue
    ///
    /// The primary queue is kept since the external event source targets it;
    /// it becomes unclaimed again. Returns `false` for an unknown subscription
    /// id.
    pub async fn unsubscribe(&self, subscription_id: Uuid) -> PubSubResult<bool> {
        let removed = self.subscriptions.iter_mut().find_map(|mut entry| {
            let position = entry
                .value()
                .iter()
                .position(|handle| handle.id() == subscription_id)?;
            Some(entry.value_mut().remove(position))
        });
        self.subscriptions.retain(|_, handles| !handles.is_empty());

        let Some(handle) = removed else {
            return Ok(false);
        };

        handle.stop(self.config.shutdown_timeout()).await;

        if handle.is_primary() {
            self.topology
                .release_primary(handle.topic(), handle.queue_id().clone());
            self.adopt_primary(handle.topic());
        } else {
            self.delete_queue(handle.queue_id()).await?;
            self.topology.forget_queue(handle.topic(), handle.queue_id());
        }

        log_subscription_operation(
            "unsubscribe",
            handle.topic(),
            &subscription_id.to_string(),
            Some(handle.queue_id().as_str()),
            "removed",
        );
        Ok(true)
    }

    /// Stop every subscription of `topic`, then delete all of its queues
    ///
    /// Every queue deletion is attempted. The first failure is returned.
    pub async fn delete_topic(&self, topic: &str) -> PubSubResult<()> {
        let mut handles = self
            .subscriptions
            .remove(topic)
            .map(|(_, handles)| handles)
            .unwrap_or_default();
        handles.extend(self.relays.remove(topic).map(|(_, relay)| relay));
        self.stop_all(&handles).await;

        let topology = &self.topology;
        let queues = match self
            .topology
            .retry_policy()
            .call("discover_topic_queues", &self.shutdown, || {
                topology.resolve_fresh(topic)
            })
            .await
        {
            Ok(queues) => queues,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(
                    topic = %topic,
                    error = %err,
                    "Queue discovery failed, deleting locally known queues only"
                );
                self.topology.forget_topic(topic)
            }
        };

        let results = join_all(queues.iter().map(|queue| self.delete_queue(queue))).await;
        self.topology.forget_topic(topic);
        self.events.forget(topic);

        let first_error = results.into_iter().find_map(Result::err);
        match &first_error {
            None => log_topic_operation(
                "delete_topic",
                topic,
                Some(queues.len()),
                "deleted",
                None,
            ),
            Some(err) => log_error("pubsub", "delete_topic", &err.to_string(), Some(topic)),
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flag `topic` as fed by an external one-shot event source
    pub async fn mark_used_on_event(&self, topic: &str) -> PubSubResult<()> {
        self.events.mark_used_on_event(topic).await?;
        self.adopt_primary(topic);
        log_topic_operation("mark_used_on_event", topic, None, "flagged", None);
        Ok(())
    }

    pub async fn unmark_used_on_event(&self, topic: &str) -> PubSubResult<()> {
        self.events.unmark_used_on_event(topic).await?;
        if let Some((_, relay)) = self.relays.remove(topic) {
            relay.stop(self.config.shutdown_timeout()).await;
            self.topology
                .release_primary(topic, relay.queue_id().clone());
        }
        log_topic_operation("unmark_used_on_event", topic, None, "unflagged", None);
        Ok(())
    }

    pub fn list_topics_used_on_event(&self) -> Vec<String> {
        self.events.list_topics_used_on_event()
    }

    /// Subscriptions of `topic` whose polling loop has not stopped
    pub fn active_subscriptions(&self, topic: &str) -> Vec<Arc<SubscriptionHandle>> {
        self.subscriptions
            .get(topic)
            .map(|handles| {
                handles
                    .iter()
                    .filter(|handle| handle.state() != SubscriptionState::Stopped)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop every subscription and drop local state; backend queues are kept
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let topics: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut handles = Vec::new();
        for topic in topics {
            if let Some((_, removed)) = self.subscriptions.remove(&topic) {
                handles.extend(removed);
            }
        }
        let relays: Vec<String> = self.relays.iter().map(|entry| entry.key().clone()).collect();
        for topic in relays {
            handles.extend(self.relays.remove(&topic).map(|(_, relay)| relay));
        }
        self.stop_all(&handles).await;

        self.topology.clear();
        self.events.clear();
        info!(stopped_subscriptions = handles.len(), "🛑 Queue pub/sub service shut down");
    }

    /// Track a spawned subscription, unless shutdown began meanwhile
    fn register(&self, topic: &str, handle: &Arc<SubscriptionHandle>) -> PubSubResult<()> {
        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(handle.clone());

        // Shutdown may have drained the map between the entry check and the insert.
        if self.shutdown.is_cancelled() {
            if let Some(mut handles) = self.subscriptions.get_mut(topic) {
                handles.retain(|registered| registered.id() != handle.id());
            }
            self.subscriptions.retain(|_, handles| !handles.is_empty());
            handle.cancel();
            return Err(PubSubError::cancelled("subscribe"));
        }
        Ok(())
    }

    /// Start a relay on an unclaimed primary of an event-sourced topic
    fn adopt_primary(&self, topic: &str) {
        if self.shutdown.is_cancelled()
            || !self.events.is_used_on_event(topic)
            || self
                .relays
                .get(topic)
                .is_some_and(|relay| relay.state() != SubscriptionState::Stopped)
        {
            return;
        }
        let Some(primary) = self.topology.take_unpolled_primary(topic) else {
            return;
        };

        let relay = SubscriptionPoller::relay(
            topic,
            primary,
            self.topology.clone(),
            self.events.clone(),
            ignore_errors(),
            &self.config,
        )
        .spawn();
        log_subscription_operation(
            "relay",
            topic,
            &relay.id().to_string(),
            Some(relay.queue_id().as_str()),
            "forwarding",
        );

        if let Some(previous) = self.relays.insert(topic.to_string(), relay.clone()) {
            previous.cancel();
        }
        if self.shutdown.is_cancelled() {
            relay.cancel();
        }
    }

    async fn stop_all(&self, handles: &[Arc<SubscriptionHandle>]) {
        for handle in handles {
            handle.cancel();
        }

        let timeout = self.config.shutdown_timeout();
        let outcomes = join_all(handles.iter().map(|handle| handle.stop(timeout))).await;
        let aborted = outcomes.iter().filter(|stopped| !**stopped).count();
        debug!(
            stopped = handles.len(),
            aborted = aborted,
            "Subscriptions stopped"
        );
    }

    /// Delete one queue, treating an already-deleted queue as success
    async fn delete_queue(&self, queue: &QueueId) -> PubSubResult<()> {
        let backend = &self.backend;
        let result = self
            .topology
            .retry_policy()
            .call("delete_queue", &self.shutdown, || async move {
                Ok(backend.delete_queue(queue).await?)
            })
            .await;

        match result {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }
}

impl Drop for QueuePubSub {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            for handle in entry.value() {
                handle.cancel();
            }
        }
        for relay in self.relays.iter() {
            relay.value().cancel();
        }
        self.shutdown.cancel();
    }
}
