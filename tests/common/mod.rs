//! Helper functions for integration tests
//!

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use fanout_core::config::PubSubConfig;
use fanout_core::messaging::InMemoryQueueBackend;
use fanout_core::pubsub::{ErrorCallback, MessageHandler, QueuePubSub};
use fanout_core::PubSubError;

/// Upper bound for any "eventually" assertion
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Short waits and backoffs so loops react within milliseconds
pub fn fast_config() -> PubSubConfig {
    PubSubConfig {
        retry_backoff_ms: 10,
        receive_wait_seconds: 1,
        poll_error_backoff_ms: 20,
        shutdown_timeout_ms: 2000,
        ..PubSubConfig::default()
    }
}

pub async fn create_service(backend: &Arc<InMemoryQueueBackend>) -> QueuePubSub {
    create_service_with(backend, fast_config()).await
}

pub async fn create_service_with(
    backend: &Arc<InMemoryQueueBackend>,
    config: PubSubConfig,
) -> QueuePubSub {
    QueuePubSub::new(backend.clone(), config)
        .await
        .expect("service should start against the in-memory backend")
}

/// Records every message it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error for this exact message body (after recording it)
    pub fn failing_on(message: &str) -> Self {
        Self {
            fail_on: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Sleep before recording each message
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn has_received(&self, message: &str) -> bool {
        self.received.lock().iter().any(|m| m == message)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _topic: &str, message: &str) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.received.lock().push(message.to_string());
        if self.fail_on.as_deref() == Some(message) {
            anyhow::bail!("handler rejected {message}");
        }
        Ok(())
    }
}

/// Collects errors routed to a subscription's error callback
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    errors: Arc<Mutex<Vec<String>>>,
    handler_errors: Arc<Mutex<usize>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> ErrorCallback {
        let collector = self.clone();
        Arc::new(move |err: &PubSubError| {
            if matches!(err, PubSubError::Handler { .. }) {
                *collector.handler_errors.lock() += 1;
            }
            collector.errors.lock().push(err.to_string());
        })
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn handler_error_count(&self) -> usize {
        *self.handler_errors.lock()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}
