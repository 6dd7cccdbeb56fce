//! # Retry/Backoff Policy
//!
//! Wraps backend calls so that a throttling signal causes the *entire*
//! operation to run again after a fixed wait. Operations passed to
//! [`RetryPolicy::call`] must therefore be safe to repeat.
//!
//! Any error other than throttling is returned immediately. Cancellation
//! during the backoff wait yields [`PubSubError::Cancelled`]. Attempts are
//! capped by `max_attempts`; `None` keeps retrying for as long as the
//! backend keeps throttling.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::shutdown::ShutdownSignal;
use crate::config::PubSubConfig;
use crate::error::{PubSubError, PubSubResult};
use crate::messaging::BackendError;

/// Fixed-interval retry on throttling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    pub fn from_config(config: &PubSubConfig) -> Self {
        Self::new(config.retry_backoff(), config.max_retry_attempts)
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Run `operation`, re-running it from scratch while the backend throttles
    pub async fn call<F, Fut, T>(
        &self,
        operation_name: &str,
        shutdown: &ShutdownSignal,
        mut operation: F,
    ) -> PubSubResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PubSubResult<T>>,
    {
        let mut attempts: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Err(PubSubError::cancelled(operation_name));
            }

            attempts = attempts.saturating_add(1);
            let last_error = match operation().await {
                Err(PubSubError::Backend(err @ BackendError::Throttled { .. })) => err,
                other => return other,
            };

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                warn!(
                    operation = %operation_name,
                    attempts = attempts,
                    error = %last_error,
                    "🛑 Retry attempts exhausted while throttled"
                );
                return Err(PubSubError::RetryExhausted {
                    operation: operation_name.to_string(),
                    attempts,
                    last_error,
                });
            }

            debug!(
                operation = %operation_name,
                attempt = attempts,
                backoff_ms = self.backoff.as_millis(),
                "🐢 Backend throttled, backing off"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {},
                _ = shutdown.cancelled() => {
                    debug!(operation = %operation_name, "Cancelled during retry backoff");
                    return Err(PubSubError::cancelled(operation_name));
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PubSubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn throttled() -> PubSubError {
        BackendError::throttled("send_message", "rate exceeded").into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_whole_operation_after_fixed_backoff() {
        let policy = RetryPolicy::new(Duration::from_millis(500), None);
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = policy
            .call("publish", &ShutdownSignal::new(), || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(throttled())
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two fixed (non-exponential) waits.
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_non_throttling_errors_are_not_retried() {
        let policy = RetryPolicy::new(Duration::from_millis(1), None);
        let calls = AtomicU32::new(0);

        let result: PubSubResult<()> = policy
            .call("ensure", &ShutdownSignal::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PubSubError::permission("orders", "denied")) }
            })
            .await;

        assert!(matches!(result, Err(PubSubError::Permission { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling_reports_last_throttle() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Some(3));
        let calls = AtomicU32::new(0);

        let result: PubSubResult<()> = policy
            .call("publish", &ShutdownSignal::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(throttled()) }
            })
            .await;

        match result {
            Err(PubSubError::RetryExhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_throttled());
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_aborts() {
        let policy = RetryPolicy::new(Duration::from_secs(3600), None);
        let shutdown = ShutdownSignal::new();

        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                shutdown.cancel();
            })
        };

        let result: PubSubResult<()> = tokio::time::timeout(
            Duration::from_secs(2),
            policy.call("publish", &shutdown, || async { Err(throttled()) }),
        )
        .await
        .expect("cancellation must interrupt the backoff wait");

        assert!(matches!(result, Err(PubSubError::Cancelled { .. })));
        canceller.await.unwrap();
    }
}
