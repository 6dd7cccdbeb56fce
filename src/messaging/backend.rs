//! # Queue Backend Contract
//!
//! The minimum set of point-to-point queue operations the pub/sub emulation
//! layer needs from a managed queueing service. Provider adapters implement
//! [`QueueBackend`]; the core never talks to a provider SDK directly.
//!
//! Every operation may fail with [`BackendError::Throttled`](super::BackendError::Throttled),
//! which is distinct from all other failures and is the only error the retry
//! policy reacts to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::errors::BackendResult;

/// Backend-assigned queue identity (an opaque handle, typically a URL)
///
/// Backends guarantee the final `/`-separated segment of the handle is the
/// queue name the queue was created with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Raw backend handle
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Queue name encoded in the handle
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message leased from a queue by `receive_messages`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Backend message identifier, stable across redeliveries
    pub message_id: String,
    pub body: String,
    /// Lease token used to acknowledge (delete) this delivery
    pub ack_token: String,
}

/// One page of a `list_queues` response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePage {
    pub queues: Vec<QueueId>,
    /// Continuation token; `None` on the last page
    pub next_token: Option<String>,
}

/// Point-to-point queue operations consumed by the pub/sub core
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create a queue
    ///
    /// Creating an existing name either returns the existing queue or fails
    /// with [`BackendError::QueueAlreadyExists`](super::BackendError::QueueAlreadyExists);
    /// callers treat both as success.
    async fn create_queue(&self, name: &str) -> BackendResult<QueueId>;

    /// List queues whose name starts with `name_prefix`, one page at a time
    async fn list_queues(
        &self,
        name_prefix: &str,
        next_token: Option<String>,
    ) -> BackendResult<QueuePage>;

    /// Enqueue a message body, returning the backend message id
    async fn send_message(&self, queue: &QueueId, body: &str) -> BackendResult<String>;

    /// Long-poll receive; leased messages stay invisible for `lease_seconds`
    async fn receive_messages(
        &self,
        queue: &QueueId,
        max_count: u32,
        wait_seconds: u32,
        lease_seconds: u32,
    ) -> BackendResult<Vec<ReceivedMessage>>;

    /// Acknowledge a delivery
    async fn delete_message(&self, queue: &QueueId, ack_token: &str) -> BackendResult<()>;

    /// Delete a queue; deleting a missing queue succeeds
    async fn delete_queue(&self, queue: &QueueId) -> BackendResult<()>;

    async fn tag_queue(&self, queue: &QueueId, key: &str, value: &str) -> BackendResult<()>;

    async fn untag_queue(&self, queue: &QueueId, key: &str) -> BackendResult<()>;

    async fn list_queue_tags(&self, queue: &QueueId) -> BackendResult<HashMap<String, String>>;

    /// Authorize the external one-shot event source to deliver into `queue`
    async fn grant_external_publish_permission(&self, queue: &QueueId) -> BackendResult<()>;

    /// Backend type for debugging/observability
    fn backend_type(&self) -> &'static str;

    /// Follow `list_queues` pagination to the end
    async fn list_all_queues(&self, name_prefix: &str) -> BackendResult<Vec<QueueId>> {
        let mut queues = Vec::new();
        let mut next_token = None;
        loop {
            let page = self.list_queues(name_prefix, next_token).await?;
            queues.extend(page.queues);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_id_name_from_url_handle() {
        let id = QueueId::new("https://queue.example.com/123456789012/orders-events");
        assert_eq!(id.name(), "orders-events");
        assert_eq!(id.to_string(), id.as_str());

        let bare = QueueId::new("orders");
        assert_eq!(bare.name(), "orders");
    }
}
