use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::DeliveryError;
use crate::config::TimingConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt for transient failures.
    pub transient_retries: u32,
    /// Backoff before retry n is `backoff_step * n`.
    pub backoff_step: Duration,
    /// Added on top of every mandated rate-limit wait.
    pub rate_limit_margin: Duration,
}

impl RetryPolicy {
    pub fn for_delivery(timing: &TimingConfig) -> Self {
        Self {
            transient_retries: timing.transient_retries,
            backoff_step: Duration::from_millis(timing.transient_backoff_ms),
            rate_limit_margin: Duration::from_millis(timing.rate_limit_margin_ms),
        }
    }

    /// Media downloads: `download_retries` total attempts, one second steps.
    pub fn for_downloads(timing: &TimingConfig) -> Self {
        Self {
            transient_retries: timing.download_retries.saturating_sub(1),
            backoff_step: Duration::from_secs(1),
            rate_limit_margin: Duration::from_millis(timing.rate_limit_margin_ms),
        }
    }
}

/// Runs outbound calls under the rate-limit and retry policy.
///
/// - `RateLimited(wait)`: sleep `wait + margin`, then retry. Unbounded, the
///   wait is authoritative.
/// - `Transient`: retry with linearly growing backoff until the retry budget
///   is spent, then return the last error.
/// - `Permanent`: return immediately.
#[derive(Debug, Clone)]
pub struct RateLimitedSender {
    policy: RetryPolicy,
}

impl RateLimitedSender {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeliveryError>>,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(DeliveryError::RateLimited(wait)) => {
                    let pause = wait + self.policy.rate_limit_margin;
                    warn!("{}: rate limited, sleeping {:?}", label, pause);
                    tokio::time::sleep(pause).await;
                }
                Err(DeliveryError::Transient(msg)) => {
                    if retries >= self.policy.transient_retries {
                        return Err(DeliveryError::Transient(msg));
                    }
                    retries += 1;
                    let backoff = self.policy.backoff_step * retries;
                    warn!(
                        "{}: transient failure ({}), retry {}/{} in {:?}",
                        label, msg, retries, self.policy.transient_retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e @ DeliveryError::Permanent(_)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn sender() -> RateLimitedSender {
        RateLimitedSender::new(RetryPolicy {
            transient_retries: 3,
            backoff_step: Duration::from_secs(1),
            rate_limit_margin: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_then_retries() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = sender()
            .call("send_text", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(DeliveryError::RateLimited(Duration::from_secs(5)))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_does_not_use_retry_budget() {
        let calls = AtomicU32::new(0);
        let result = sender()
            .call("send_photo", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 10 {
                        Err(DeliveryError::RateLimited(Duration::from_secs(1)))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_linear_backoff() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = sender()
            .call("edit_text", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DeliveryError::Transient("timeout".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s before the first retry, 2s before the second
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = sender()
            .call("send_video", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::Transient("bad gateway".to_string())) }
            })
            .await;

        assert_eq!(result, Err(DeliveryError::Transient("bad gateway".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = sender()
            .call("send_document", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::Permanent("chat not found".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(DeliveryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
