//! # In-Memory Queue Backend
//!
//! In-memory point-to-point queue backend for tests, benchmarks and local
//! development. Provides a complete [`QueueBackend`] implementation with the
//! semantics the pub/sub layer relies on:
//!
//! - **Visibility timeouts**: received messages are leased and hidden until
//!   the lease expires or the delivery is acknowledged
//! - **Long polling**: `receive_messages` waits up to `wait_seconds` for work
//! - **Pagination**: `list_queues` pages with a configurable page size
//! - **Tags and permissions**: per-queue tags and external publish grants
//! - **Fault injection**: forced throttling, permission failures, duplicate
//!   deliveries, strict (non-idempotent) creates and call latency
//! - **Observability**: per-operation call counters
//!
//! ## Usage
//!
//! ```rust
//! use fanout_core::messaging::{InMemoryQueueBackend, QueueBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = InMemoryQueueBackend::new();
//! let queue = backend.create_queue("orders").await?;
//! backend.send_message(&queue, "hello").await?;
//! let messages = backend.receive_messages(&queue, 10, 0, 30).await?;
//! assert_eq!(messages.len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use super::backend::{QueueBackend, QueueId, QueuePage, ReceivedMessage};
use super::errors::{BackendError, BackendResult};

const URL_PREFIX: &str = "memory://queues/";
const DEFAULT_PAGE_SIZE: usize = 1000;
const LONG_POLL_TICK: Duration = Duration::from_millis(25);

/// Message wrapper for in-memory storage with lease metadata
#[derive(Debug, Clone)]
pub struct InMemoryMessage {
    pub id: String,
    pub body: String,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: Option<DateTime<Utc>>,
    pub receipt: Option<String>,
}

/// In-memory queue storage
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    pub messages: VecDeque<InMemoryMessage>,
    pub tags: HashMap<String, String>,
    pub external_publish_granted: bool,
}

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct BackendCallCounts {
    pub create_queue: AtomicU64,
    pub list_queues: AtomicU64,
    pub send_message: AtomicU64,
    pub receive_messages: AtomicU64,
    pub delete_message: AtomicU64,
    pub delete_queue: AtomicU64,
    pub tag_operations: AtomicU64,
    pub grant_permission: AtomicU64,
}

/// In-memory backend implementation
#[derive(Debug)]
pub struct InMemoryQueueBackend {
    queues: Mutex<BTreeMap<String, InMemoryQueue>>,
    arrivals: Notify,
    page_size: usize,
    throttle_remaining: AtomicU32,
    deny_permission_grants: AtomicBool,
    duplicate_deliveries: AtomicBool,
    reject_existing_creates: AtomicBool,
    latency_ms: AtomicU64,
    calls: BackendCallCounts,
    created_at: DateTime<Utc>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create a backend whose `list_queues` returns at most `page_size` queues per page
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            arrivals: Notify::new(),
            page_size: page_size.max(1),
            throttle_remaining: AtomicU32::new(0),
            deny_permission_grants: AtomicBool::new(false),
            duplicate_deliveries: AtomicBool::new(false),
            reject_existing_creates: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            calls: BackendCallCounts::default(),
            created_at: Utc::now(),
        }
    }

    /// Fail the next `count` operations (of any kind) with a throttling error
    pub fn throttle_next(&self, count: u32) {
        self.throttle_remaining.store(count, Ordering::SeqCst);
    }

    /// Make `grant_external_publish_permission` fail with a permission error
    pub fn deny_permission_grants(&self, deny: bool) {
        self.deny_permission_grants.store(deny, Ordering::SeqCst);
    }

    /// Return every received message twice within the same batch
    pub fn duplicate_deliveries(&self, enabled: bool) {
        self.duplicate_deliveries.store(enabled, Ordering::SeqCst);
    }

    /// Make `create_queue` fail with `QueueAlreadyExists` for existing names
    pub fn reject_existing_creates(&self, enabled: bool) {
        self.reject_existing_creates.store(enabled, Ordering::SeqCst);
    }

    /// Delay every queue-management call (create, list, delete) by `latency`
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn calls(&self) -> &BackendCallCounts {
        &self.calls
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Handle a queue named `name` would be assigned
    pub fn queue_url(name: &str) -> QueueId {
        QueueId::new(format!("{URL_PREFIX}{name}"))
    }

    /// Names of all existing queues, sorted
    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.lock().await.keys().cloned().collect()
    }

    /// Number of stored (visible or leased) messages in a queue
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queues
            .lock()
            .await
            .get(name)
            .map(|queue| queue.messages.len())
    }

    pub async fn has_external_publish_grant(&self, name: &str) -> bool {
        self.queues
            .lock()
            .await
            .get(name)
            .map(|queue| queue.external_publish_granted)
            .unwrap_or(false)
    }

    /// Deliver a message the way an external one-shot event source would
    ///
    /// Requires the queue to have been granted external publish permission.
    pub async fn deliver_external_event(&self, name: &str, body: &str) -> BackendResult<String> {
        {
            let queues = self.queues.lock().await;
            let queue = queues
                .get(name)
                .ok_or_else(|| BackendError::queue_not_found(name))?;
            if !queue.external_publish_granted {
                return Err(BackendError::permission_denied(
                    name,
                    "external event source is not authorized for this queue",
                ));
            }
        }
        self.enqueue(name, body).await
    }

    fn check_faults(&self, operation: &str) -> BackendResult<()> {
        let throttled = self
            .throttle_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if throttled {
            debug!(operation = %operation, "🐢 In-memory backend injecting throttle");
            return Err(BackendError::throttled(operation, "injected throttling"));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn enqueue(&self, name: &str, body: &str) -> BackendResult<String> {
        let message_id = Uuid::new_v4().to_string();
        {
            let mut queues = self.queues.lock().await;
            let queue = queues
                .get_mut(name)
                .ok_or_else(|| BackendError::queue_not_found(name))?;
            queue.messages.push_back(InMemoryMessage {
                id: message_id.clone(),
                body: body.to_string(),
                enqueued_at: Utc::now(),
                visible_at: None,
                receipt: None,
            });
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    /// Lease up to `max_count` visible messages; `None` if the queue is gone
    async fn lease_available(
        &self,
        name: &str,
        max_count: u32,
        lease_seconds: u32,
    ) -> Option<Vec<ReceivedMessage>> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(name)?;

        let now = Utc::now();
        let visible_at = now + chrono::Duration::seconds(i64::from(lease_seconds));
        let duplicate = self.duplicate_deliveries.load(Ordering::SeqCst);

        let mut leased = Vec::new();
        for message in queue.messages.iter_mut() {
            if leased.len() >= max_count as usize {
                break;
            }

            let is_available = message.visible_at.map(|at| at <= now).unwrap_or(true);
            if !is_available {
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            message.visible_at = Some(visible_at);
            message.receipt = Some(receipt.clone());
            leased.push(ReceivedMessage {
                message_id: message.id.clone(),
                body: message.body.clone(),
                ack_token: receipt,
            });
        }

        if duplicate {
            // Stale receipts are accepted by delete_message, so the copy is acknowledgeable.
            let copies: Vec<_> = leased
                .iter()
                .map(|message| ReceivedMessage {
                    ack_token: Uuid::new_v4().to_string(),
                    ..message.clone()
                })
                .collect();
            leased.extend(copies);
        }

        Some(leased)
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn create_queue(&self, name: &str) -> BackendResult<QueueId> {
        self.calls.create_queue.fetch_add(1, Ordering::Relaxed);
        self.check_faults("create_queue")?;
        self.simulate_latency().await;

        let mut queues = self.queues.lock().await;
        if queues.contains_key(name) && self.reject_existing_creates.load(Ordering::SeqCst) {
            return Err(BackendError::queue_already_exists(name));
        }
        queues.entry(name.to_string()).or_default();
        debug!(queue = %name, "📋 In-memory queue ensured");
        Ok(Self::queue_url(name))
    }

    async fn list_queues(
        &self,
        name_prefix: &str,
        next_token: Option<String>,
    ) -> BackendResult<QueuePage> {
        self.calls.list_queues.fetch_add(1, Ordering::Relaxed);
        self.check_faults("list_queues")?;
        self.simulate_latency().await;

        let offset = match next_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                BackendError::queue_operation(name_prefix, "list_queues", "invalid next token")
            })?,
            None => 0,
        };

        let queues = self.queues.lock().await;
        let matching: Vec<&String> = queues
            .keys()
            .filter(|name| name.starts_with(name_prefix))
            .collect();

        let page: Vec<QueueId> = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|name| Self::queue_url(name))
            .collect();
        let consumed = offset + page.len();
        let next_token = (consumed < matching.len()).then(|| consumed.to_string());

        Ok(QueuePage {
            queues: page,
            next_token,
        })
    }

    async fn send_message(&self, queue: &QueueId, body: &str) -> BackendResult<String> {
        self.calls.send_message.fetch_add(1, Ordering::Relaxed);
        self.check_faults("send_message")?;
        self.enqueue(queue.name(), body).await
    }

    async fn receive_messages(
        &self,
        queue: &QueueId,
        max_count: u32,
        wait_seconds: u32,
        lease_seconds: u32,
    ) -> BackendResult<Vec<ReceivedMessage>> {
        self.calls.receive_messages.fetch_add(1, Ordering::Relaxed);
        self.check_faults("receive_messages")?;

        let name = queue.name();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(u64::from(wait_seconds));

        loop {
            let arrival = self.arrivals.notified();
            let leased = self
                .lease_available(name, max_count, lease_seconds)
                .await
                .ok_or_else(|| BackendError::queue_not_found(name))?;

            let now = tokio::time::Instant::now();
            if !leased.is_empty() || now >= deadline {
                return Ok(leased);
            }

            // Lease expiry is time driven, so wake periodically even without arrivals.
            let tick = LONG_POLL_TICK.min(deadline - now);
            let _ = tokio::time::timeout(tick, arrival).await;
        }
    }

    async fn delete_message(&self, queue: &QueueId, ack_token: &str) -> BackendResult<()> {
        self.calls.delete_message.fetch_add(1, Ordering::Relaxed);
        self.check_faults("delete_message")?;

        let mut queues = self.queues.lock().await;
        let stored = queues
            .get_mut(queue.name())
            .ok_or_else(|| BackendError::queue_not_found(queue.name()))?;
        stored
            .messages
            .retain(|message| message.receipt.as_deref() != Some(ack_token));
        Ok(())
    }

    async fn delete_queue(&self, queue: &QueueId) -> BackendResult<()> {
        self.calls.delete_queue.fetch_add(1, Ordering::Relaxed);
        self.check_faults("delete_queue")?;
        self.simulate_latency().await;

        let removed = self.queues.lock().await.remove(queue.name()).is_some();
        debug!(queue = %queue, removed = removed, "🗑️ In-memory queue deleted");
        Ok(())
    }

    async fn tag_queue(&self, queue: &QueueId, key: &str, value: &str) -> BackendResult<()> {
        self.calls.tag_operations.fetch_add(1, Ordering::Relaxed);
        self.check_faults("tag_queue")?;

        let mut queues = self.queues.lock().await;
        let stored = queues
            .get_mut(queue.name())
            .ok_or_else(|| BackendError::queue_not_found(queue.name()))?;
        stored.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn untag_queue(&self, queue: &QueueId, key: &str) -> BackendResult<()> {
        self.calls.tag_operations.fetch_add(1, Ordering::Relaxed);
        self.check_faults("untag_queue")?;

        let mut queues = self.queues.lock().await;
        let stored = queues
            .get_mut(queue.name())
            .ok_or_else(|| BackendError::queue_not_found(queue.name()))?;
        stored.tags.remove(key);
        Ok(())
    }

    async fn list_queue_tags(&self, queue: &QueueId) -> BackendResult<HashMap<String, String>> {
        self.calls.tag_operations.fetch_add(1, Ordering::Relaxed);
        self.check_faults("list_queue_tags")?;

        let queues = self.queues.lock().await;
        queues
            .get(queue.name())
            .map(|stored| stored.tags.clone())
            .ok_or_else(|| BackendError::queue_not_found(queue.name()))
    }

    async fn grant_external_publish_permission(&self, queue: &QueueId) -> BackendResult<()> {
        self.calls.grant_permission.fetch_add(1, Ordering::Relaxed);
        self.check_faults("grant_external_publish_permission")?;

        if self.deny_permission_grants.load(Ordering::SeqCst) {
            return Err(BackendError::permission_denied(
                queue.name(),
                "policy update rejected",
            ));
        }

        let mut queues = self.queues.lock().await;
        let stored = queues
            .get_mut(queue.name())
            .ok_or_else(|| BackendError::queue_not_found(queue.name()))?;
        stored.external_publish_granted = true;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_queue_is_idempotent() {
        let backend = InMemoryQueueBackend::new();
        let first = backend.create_queue("orders").await.unwrap();
        let second = backend.create_queue("orders").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name(), "orders");
        assert_eq!(backend.queue_names().await, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_strict_create_rejects_existing_name() {
        let backend = InMemoryQueueBackend::new();
        backend.create_queue("orders").await.unwrap();
        backend.reject_existing_creates(true);

        let err = backend.create_queue("orders").await.unwrap_err();
        assert!(matches!(err, BackendError::QueueAlreadyExists { .. }));
        assert!(backend.create_queue("payments").await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_hides_message_until_acknowledged() {
        let backend = InMemoryQueueBackend::new();
        let queue = backend.create_queue("orders").await.unwrap();
        backend.send_message(&queue, "hello").await.unwrap();

        let first = backend.receive_messages(&queue, 10, 0, 30).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, "hello");

        let second = backend.receive_messages(&queue, 10, 0, 30).await.unwrap();
        assert!(second.is_empty(), "leased message must stay invisible");

        backend
            .delete_message(&queue, &first[0].ack_token)
            .await
            .unwrap();
        assert_eq!(backend.queue_depth("orders").await, Some(0));
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_arrival() {
        let backend = std::sync::Arc::new(InMemoryQueueBackend::new());
        let queue = backend.create_queue("orders").await.unwrap();

        let receiver = {
            let backend = backend.clone();
            let queue = queue.clone();
            tokio::spawn(async move { backend.receive_messages(&queue, 10, 5, 30).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.send_message(&queue, "late").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("long poll should return before its wait expires")
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "late");
    }

    #[tokio::test]
    async fn test_list_queues_paginates() {
        let backend = InMemoryQueueBackend::with_page_size(2);
        for name in ["orders", "orders-a", "orders-b", "other"] {
            backend.create_queue(name).await.unwrap();
        }

        let page = backend.list_queues("orders", None).await.unwrap();
        assert_eq!(page.queues.len(), 2);
        assert!(page.next_token.is_some());

        let all = backend.list_all_queues("orders").await.unwrap();
        let names: Vec<_> = all.iter().map(|id| id.name().to_string()).collect();
        assert_eq!(names, vec!["orders", "orders-a", "orders-b"]);
    }

    #[tokio::test]
    async fn test_throttle_injection_counts_down() {
        let backend = InMemoryQueueBackend::new();
        backend.throttle_next(2);

        assert!(backend.create_queue("a").await.unwrap_err().is_throttled());
        assert!(backend.create_queue("a").await.unwrap_err().is_throttled());
        assert!(backend.create_queue("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_external_delivery_requires_grant() {
        let backend = InMemoryQueueBackend::new();
        let queue = backend.create_queue("bucket-events").await.unwrap();

        let denied = backend
            .deliver_external_event("bucket-events", "{}")
            .await
            .unwrap_err();
        assert!(matches!(denied, BackendError::PermissionDenied { .. }));

        backend.grant_external_publish_permission(&queue).await.unwrap();
        backend
            .deliver_external_event("bucket-events", "{}")
            .await
            .unwrap();
        assert_eq!(backend.queue_depth("bucket-events").await, Some(1));
    }

    #[tokio::test]
    async fn test_operations_on_deleted_queue_report_not_found() {
        let backend = InMemoryQueueBackend::new();
        let queue = backend.create_queue("gone").await.unwrap();
        backend.delete_queue(&queue).await.unwrap();
        backend.delete_queue(&queue).await.unwrap();

        let err = backend.receive_messages(&queue, 1, 0, 30).await.unwrap_err();
        assert!(err.is_not_found());
        let err = backend.send_message(&queue, "x").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
