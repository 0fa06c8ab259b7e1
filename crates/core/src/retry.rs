//! Exponential-backoff retry with an explicit, testable policy
//!
//! The policy object carries everything a caller needs to reason about a
//! retry loop: attempt budget, delay curve and jitter. Retryability of a
//! given error is decided by a predicate supplied at the call site, so the
//! loop itself stays agnostic of error types.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy: attempt budget plus delay curve.
///
/// Delays follow `base * 2^attempt`, capped at `max_delay_ms`, with up to
/// 30% additive jitter when enabled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = fail on first error).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Add random jitter to spread concurrent retriers.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64, jitter: bool) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter,
        }
    }

    /// Policy for external registry calls: 3 retries starting at 2 s,
    /// matching the upstream service's documented guidance.
    pub fn registry_api() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }

    /// Gentle policy for non-critical writes (metrics, failed-item logs).
    pub fn gentle() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_delay_ms);

        let with_jitter = if self.jitter {
            let range = (capped as f64 * 0.3) as u64;
            if range > 0 {
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .subsec_nanos() as u64;
                capped.saturating_add(nanos % (range + 1))
            } else {
                capped
            }
        } else {
            capped
        };

        Duration::from_millis(with_jitter)
    }
}

/// Run `operation`, retrying per `policy` while `is_retryable` approves.
///
/// Non-retryable errors and budget exhaustion both return the last error
/// unchanged; the caller keeps full fidelity of what went wrong.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    mut operation: F,
    policy: RetryPolicy,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempt,
                        max_retries = policy.max_retries,
                        "retry budget exhausted"
                    );
                    return Err(error);
                }
                if !is_retryable(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy::new(5, 100, 1_000, false);
        assert_eq!(policy.delay_for(0).as_millis(), 100);
        assert_eq!(policy.delay_for(1).as_millis(), 200);
        assert_eq!(policy.delay_for(2).as_millis(), 400);
        assert_eq!(policy.delay_for(3).as_millis(), 800);
        // 100 * 2^4 = 1600, capped
        assert_eq!(policy.delay_for(4).as_millis(), 1_000);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3, 1_000, 5_000, true);
        let ms = policy.delay_for(0).as_millis();
        assert!(ms >= 1_000);
        assert!(ms <= 1_300);
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_with_backoff(
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(42)
                }
            },
            RetryPolicy::default(),
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_with_backoff(
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok("ok")
                    }
                }
            },
            RetryPolicy::new(5, 1, 10, false),
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("persistent")
                }
            },
            RetryPolicy::new(3, 1, 10, false),
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "persistent");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("bad request")
                }
            },
            RetryPolicy::default(),
            |e: &&str| *e != "bad request",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_budget_means_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("nope")
                }
            },
            RetryPolicy::new(0, 1, 10, false),
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn core_error_classification_drives_retries() {
        use crate::error::CoreError;

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_with_backoff(
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(CoreError::Network {
                            message: "connection timeout".into(),
                            source: None,
                        })
                    } else {
                        Ok("recovered")
                    }
                }
            },
            RetryPolicy::new(3, 1, 10, false),
            |e: &CoreError| e.is_retryable(),
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
