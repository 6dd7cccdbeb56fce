//! # Subscription Runtime
//!
//! One polling loop per subscription, bound to the subscriber's dedicated
//! queue. Each iteration long-polls a batch, deduplicates it by message id,
//! hands every unique message to the caller's handler, and acknowledges the
//! whole batch regardless of handler outcome (at-least-once delivery).
//!
//! A subscription bound to the *primary* queue of a topic flagged as
//! event-sourced also re-sends each batch to every sibling queue, so that
//! messages an external source could only deliver to the primary reach all
//! subscribers.
//!
//! A *relay* is the same loop without a handler. It keeps an event-sourced
//! primary drained while no subscriber is bound to it: batches are only
//! forwarded and acknowledged, and are left untouched while the topic has no
//! other queue to forward to.
//!
//! ## State machine
//!
//! `Created → Polling → Stopped`. The loop stops on cancellation or when its
//! queue no longer exists. Any other error is reported through the error
//! callback, followed by a fixed pause before polling resumes.

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_source::EventSourceRegistry;
use super::handler::{ErrorCallback, MessageHandler};
use super::retry::RetryPolicy;
use super::shutdown::ShutdownSignal;
use super::topology::TopologyManager;
use crate::config::PubSubConfig;
use crate::error::{PubSubError, PubSubResult};
use crate::logging::{log_error, log_subscription_operation};
use crate::messaging::{QueueBackend, QueueId, ReceivedMessage};

/// Lifecycle of a subscription's polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Created = 0,
    Polling = 1,
    Stopped = 2,
}

impl From<u8> for SubscriptionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Created,
            1 => SubscriptionState::Polling,
            _ => SubscriptionState::Stopped,
        }
    }
}

/// Runtime statistics for one subscription
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    /// Non-empty batches received
    pub batches_received: AtomicU64,
    /// Unique messages passed to the handler
    pub messages_handled: AtomicU64,
    pub handler_errors: AtomicU64,
    /// Copies re-sent to sibling queues
    pub messages_forwarded: AtomicU64,
    pub poll_errors: AtomicU64,
}

/// Owner-side view of a running subscription
pub struct SubscriptionHandle {
    id: Uuid,
    topic: String,
    queue: QueueId,
    state: Arc<AtomicU8>,
    stats: Arc<SubscriptionStats>,
    shutdown: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue
    }

    /// Bound to the topic's primary queue
    pub fn is_primary(&self) -> bool {
        self.queue.name() == self.topic
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    /// Request the loop to stop at its next suspension point
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Cancel and wait up to `timeout` for the loop to finish
    ///
    /// Returns `false` if the loop had to be aborted.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.cancel();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return true;
        };

        let stopped = match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    subscription_id = %self.id,
                    topic = %self.topic,
                    timeout_ms = timeout.as_millis(),
                    "Polling loop did not stop in time, aborting"
                );
                task.abort();
                false
            }
        };
        self.state
            .store(SubscriptionState::Stopped as u8, Ordering::Release);
        stopped
    }
}

/// Everything a polling loop needs, moved into its task
pub(crate) struct SubscriptionPoller {
    id: Uuid,
    topic: String,
    queue: QueueId,
    backend: Arc<dyn QueueBackend>,
    topology: Arc<TopologyManager>,
    events: Arc<EventSourceRegistry>,
    handler: Option<Arc<dyn MessageHandler>>,
    on_error: ErrorCallback,
    retry: RetryPolicy,
    batch_size: u32,
    wait_seconds: u32,
    lease_seconds: u32,
    error_backoff: Duration,
    state: Arc<AtomicU8>,
    stats: Arc<SubscriptionStats>,
    shutdown: ShutdownSignal,
}

impl SubscriptionPoller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        topic: &str,
        queue: QueueId,
        topology: Arc<TopologyManager>,
        events: Arc<EventSourceRegistry>,
        handler: Arc<dyn MessageHandler>,
        on_error: ErrorCallback,
        config: &PubSubConfig,
    ) -> Self {
        Self::build(topic, queue, topology, events, Some(handler), on_error, config)
    }

    /// Forward-only loop for a primary queue nobody subscribed to
    pub(crate) fn relay(
        topic: &str,
        queue: QueueId,
        topology: Arc<TopologyManager>,
        events: Arc<EventSourceRegistry>,
        on_error: ErrorCallback,
        config: &PubSubConfig,
    ) -> Self {
        Self::build(topic, queue, topology, events, None, on_error, config)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        topic: &str,
        queue: QueueId,
        topology: Arc<TopologyManager>,
        events: Arc<EventSourceRegistry>,
        handler: Option<Arc<dyn MessageHandler>>,
        on_error: ErrorCallback,
        config: &PubSubConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            queue,
            backend: topology.backend().clone(),
            retry: topology.retry_policy().clone(),
            topology,
            events,
            handler,
            on_error,
            batch_size: config.receive_batch_size,
            wait_seconds: config.receive_wait_seconds,
            lease_seconds: config.visibility_timeout_seconds,
            error_backoff: config.poll_error_backoff(),
            state: Arc::new(AtomicU8::new(SubscriptionState::Created as u8)),
            stats: Arc::new(SubscriptionStats::default()),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Spawn the polling loop, returning its handle
    pub(crate) fn spawn(self) -> Arc<SubscriptionHandle> {
        let handle = Arc::new(SubscriptionHandle {
            id: self.id,
            topic: self.topic.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(self.run());
        *handle.task.lock() = Some(task);
        handle
    }

    async fn run(self) {
        self.state
            .store(SubscriptionState::Polling as u8, Ordering::Release);
        log_subscription_operation(
            "poll_start",
            &self.topic,
            &self.id.to_string(),
            Some(self.queue.as_str()),
            "polling",
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                result = self.receive_batch() => result,
                _ = self.shutdown.cancelled() => break,
            };

            match received {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => self.process_batch(batch).await,
                Err(err) if err.is_cancelled() => break,
                Err(err) if err.is_not_found() => {
                    info!(
                        subscription_id = %self.id,
                        topic = %self.topic,
                        queue = %self.queue,
                        "Subscription queue no longer exists, stopping"
                    );
                    break;
                }
                Err(err) => {
                    self.stats.poll_errors.fetch_add(1, Ordering::Relaxed);
                    self.report("receive", err);
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {},
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.state
            .store(SubscriptionState::Stopped as u8, Ordering::Release);
        log_subscription_operation(
            "poll_stop",
            &self.topic,
            &self.id.to_string(),
            Some(self.queue.as_str()),
            "stopped",
        );
    }

    async fn receive_batch(&self) -> PubSubResult<Vec<ReceivedMessage>> {
        let backend = &self.backend;
        let queue = &self.queue;
        let (batch_size, wait_seconds, lease_seconds) =
            (self.batch_size, self.wait_seconds, self.lease_seconds);

        self.retry
            .call("receive_messages", &self.shutdown, || async move {
                Ok(backend
                    .receive_messages(queue, batch_size, wait_seconds, lease_seconds)
                    .await?)
            })
            .await
    }

    async fn process_batch(&self, batch: Vec<ReceivedMessage>) {
        self.stats.batches_received.fetch_add(1, Ordering::Relaxed);
        let unique = unique_messages(&batch);

        debug!(
            subscription_id = %self.id,
            topic = %self.topic,
            received = batch.len(),
            unique = unique.len(),
            "📨 Processing batch"
        );

        if let Some(handler) = &self.handler {
            for message in &unique {
                // Once cancelled, leave the rest leased and invoke nothing more.
                if self.shutdown.is_cancelled() {
                    return;
                }
                self.dispatch(handler.as_ref(), message).await;
            }
        }

        let forwarded_to = if self.should_forward() {
            self.forward_to_siblings(&unique).await
        } else {
            0
        };

        // A relay only consumes what it could hand on.
        if self.handler.is_none() && forwarded_to == 0 {
            return;
        }
        self.acknowledge(&batch).await;
    }

    async fn dispatch(&self, handler: &dyn MessageHandler, message: &ReceivedMessage) {
        let outcome = AssertUnwindSafe(handler.handle(&self.topic, &message.body))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => Some(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        self.stats.messages_handled.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = failure {
            self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
            self.report(
                "handle",
                PubSubError::handler(&self.topic, &message.message_id, err),
            );
        }
    }

    fn should_forward(&self) -> bool {
        self.queue.name() == self.topic && self.events.is_used_on_event(&self.topic)
    }

    /// Re-send messages received on the primary to every other queue of the topic
    ///
    /// Returns the number of siblings the batch was sent to.
    async fn forward_to_siblings(&self, messages: &[&ReceivedMessage]) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let topology = &self.topology;
        let topic = self.topic.as_str();
        let queues = match self
            .retry
            .call("resolve_siblings", &self.shutdown, || topology.resolve(topic))
            .await
        {
            Ok(queues) => queues,
            Err(err) if err.is_cancelled() => return 0,
            Err(err) => {
                self.report("forward", err);
                return 0;
            }
        };

        let siblings: Vec<&QueueId> = queues.iter().filter(|queue| **queue != self.queue).collect();
        if siblings.is_empty() {
            return 0;
        }

        let sends = siblings.iter().flat_map(|sibling| {
            messages.iter().map(move |message| self.send_copy(sibling, message))
        });
        let results = join_all(sends).await;

        let mut forwarded = 0u64;
        for (sibling, result) in results {
            match result {
                Ok(()) => forwarded += 1,
                Err(err) if err.is_cancelled() => {}
                Err(err) if err.is_not_found() => {
                    self.topology.forget_queue(&self.topic, sibling);
                }
                Err(err) => self.report("forward", err),
            }
        }

        self.stats
            .messages_forwarded
            .fetch_add(forwarded, Ordering::Relaxed);
        debug!(
            subscription_id = %self.id,
            topic = %self.topic,
            siblings = siblings.len(),
            forwarded = forwarded,
            "🔀 Forwarded primary batch to sibling queues"
        );
        siblings.len()
    }

    async fn send_copy<'a>(
        &self,
        sibling: &'a QueueId,
        message: &ReceivedMessage,
    ) -> (&'a QueueId, PubSubResult<()>) {
        let backend = &self.backend;
        let body = message.body.as_str();
        let result = self
            .retry
            .call("forward_message", &self.shutdown, || async move {
                backend.send_message(sibling, body).await?;
                Ok(())
            })
            .await;
        (sibling, result)
    }

    /// Delete every delivery in the batch, duplicates included
    async fn acknowledge(&self, batch: &[ReceivedMessage]) {
        let backend = &self.backend;
        let queue = &self.queue;
        let deletes = batch.iter().map(|message| {
            let ack_token = message.ack_token.as_str();
            self.retry
                .call("delete_message", &self.shutdown, move || async move {
                    backend.delete_message(queue, ack_token).await?;
                    Ok(())
                })
        });

        for result in join_all(deletes).await {
            match result {
                Ok(()) => {}
                // The next receive observes a missing queue and stops the loop.
                Err(err) if err.is_not_found() || err.is_cancelled() => {}
                Err(err) => self.report("acknowledge", err),
            }
        }
    }

    fn report(&self, operation: &str, err: PubSubError) {
        log_error(
            "subscription",
            operation,
            &err.to_string(),
            Some(&self.topic),
        );
        (self.on_error)(&err);
    }
}

/// First delivery of each message id, in arrival order
fn unique_messages(batch: &[ReceivedMessage]) -> Vec<&ReceivedMessage> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|message| seen.insert(message.message_id.as_str()))
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, ack: &str) -> ReceivedMessage {
        ReceivedMessage {
            message_id: id.to_string(),
            body: format!("body-{id}"),
            ack_token: ack.to_string(),
        }
    }

    #[test]
    fn test_unique_messages_keeps_first_delivery() {
        let batch = vec![message("a", "1"), message("b", "2"), message("a", "3")];
        let unique = unique_messages(&batch);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].ack_token, "1");
        assert_eq!(unique[1].message_id, "b");
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(SubscriptionState::from(0), SubscriptionState::Created);
        assert_eq!(SubscriptionState::from(1), SubscriptionState::Polling);
        assert_eq!(SubscriptionState::from(2), SubscriptionState::Stopped);
        assert_eq!(SubscriptionState::from(9), SubscriptionState::Stopped);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
