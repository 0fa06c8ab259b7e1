//! Retry policies in practice
//!
//! Shows how the retry loop behaves with the two shipped presets and a
//! custom policy, using `CoreError::is_retryable` as the predicate.

use annuaire_core::{retry_with_backoff, CoreError, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Fails twice with a retryable network error, then succeeds.
async fn flaky_fetch(attempts: Arc<AtomicU32>) -> Result<String, CoreError> {
    let n = attempts.fetch_add(1, Ordering::SeqCst);
    if n < 2 {
        Err(CoreError::Network {
            message: format!("connection reset on attempt {}", n + 1),
            source: None,
        })
    } else {
        Ok(format!("fetched after {} attempts", n + 1))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Registry preset: 3 retries starting at 2 s. The flaky call recovers
    // on the third attempt.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = retry_with_backoff(
        || flaky_fetch(counter.clone()),
        RetryPolicy::registry_api(),
        CoreError::is_retryable,
    )
    .await?;
    println!("registry_api preset: {result}");

    // Deterministic errors short-circuit: one attempt, no sleeping.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = retry_with_backoff(
        || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(CoreError::validation("postal code must be 5 digits"))
            }
        },
        RetryPolicy::gentle(),
        CoreError::is_retryable,
    )
    .await;
    println!(
        "validation error: {:?} after {} attempt(s)",
        result.err().map(|e| e.to_string()),
        attempts.load(Ordering::SeqCst)
    );

    // Custom policy for a tight inner loop: fast, no jitter.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = retry_with_backoff(
        || flaky_fetch(counter.clone()),
        RetryPolicy::new(5, 50, 500, false),
        CoreError::is_retryable,
    )
    .await?;
    println!("custom policy: {result}");

    Ok(())
}
