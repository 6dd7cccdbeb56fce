//! Caller-supplied callbacks for subscriptions.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::PubSubError;

/// Processes one message delivered to a subscription
///
/// Implemented for any `Fn(String, String) -> impl Future<Output = anyhow::Result<()>>`
/// closure taking `(topic, message)`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, message: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, topic: &str, message: &str) -> anyhow::Result<()> {
        (self)(topic.to_string(), message.to_string()).await
    }
}

/// Out-of-band error reporting for a running subscription
pub type ErrorCallback = Arc<dyn Fn(&PubSubError) + Send + Sync>;

/// Error callback that ignores every error (they are still logged)
pub fn ignore_errors() -> ErrorCallback {
    Arc::new(|_| {})
}
