//! Retry policy for collaborator calls
//!
//! - Transient: retried with exponential backoff (1s, 2s, 4s by default)
//! - Conflict: retried once; every call re-reads its base state
//! - Permission, validation, not-found: never retried

use crate::config::EngineConfig;
use crate::error::{CallError, CollaboratorError, ErrorClass};
use crate::telemetry;
use std::future::Future;
use std::time::Duration;

/// Retry policy applied around every collaborator call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_transient_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    #[inline]
    #[must_use]
    pub fn new(max_transient_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_transient_retries,
            base_delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry_max_attempts, config.retry_base_delay())
    }

    /// Backoff before transient retry number `retry` (zero-based)
    #[inline]
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32.checked_shl(retry).unwrap_or(u32::MAX))
    }

    /// Run `call` until it succeeds or the policy gives up
    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempts = 0_u32;
        let mut transient_retries = 0_u32;
        let mut conflict_retried = false;

        loop {
            attempts += 1;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Transient if transient_retries < self.max_transient_retries => {
                    let delay = self.backoff(transient_retries);
                    transient_retries += 1;
                    tracing::warn!(operation, attempts, ?delay, error = %err, "transient collaborator failure, retrying");
                    telemetry::record_retry(operation);
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Conflict if !conflict_retried => {
                    conflict_retried = true;
                    tracing::warn!(operation, error = %err, "conflicting modification, retrying with fresh state");
                    telemetry::record_retry(operation);
                }
                ErrorClass::Validation => {
                    tracing::error!(operation, error = %err, "collaborator rejected request as malformed");
                    return Err(CallError { operation, attempts, source: err });
                }
                _ => {
                    tracing::warn!(operation, attempts, error = %err, "collaborator call failed");
                    return Err(CallError { operation, attempts, source: err });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing(counter: &Arc<AtomicU32>, fail_times: u32, err: CollaboratorError) -> impl FnMut() -> std::future::Ready<Result<u32, CollaboratorError>> {
        let counter = Arc::clone(counter);
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < fail_times { Err(err.clone()) } else { Ok(n) })
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retried_three_times_then_fails() {
        let counter = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        let err = RetryPolicy::default()
            .call("get_health", failing(&counter, 10, CollaboratorError::Transient("503".into())))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_recovers() {
        let counter = Arc::new(AtomicU32::new(0));
        let value = RetryPolicy::default()
            .call("get_health", failing(&counter, 2, CollaboratorError::Transient("rate limited".into())))
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn permission_never_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let err = RetryPolicy::default()
            .call("merge_change", failing(&counter, 10, CollaboratorError::PermissionDenied("403".into())))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.source, CollaboratorError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn conflict_retried_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let err = RetryPolicy::default()
            .call("create_change", failing(&counter, 10, CollaboratorError::Conflict("stale".into())))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);

        let counter = Arc::new(AtomicU32::new(0));
        let ok = RetryPolicy::default()
            .call("create_change", failing(&counter, 1, CollaboratorError::Conflict("stale".into())))
            .await;
        assert!(ok.is_ok());
    }
}
