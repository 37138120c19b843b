//! Bounded retry with exponential backoff for external-API calls.
//!
//! Independent of the listener-level redelivery retries: this wrapper is for
//! point calls (HTTP lookups, SMTP submission) where waiting out a transient
//! failure is cheaper than bouncing the whole message.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// First backoff duration; doubles on each subsequent failure
    pub initial_backoff: Duration,
    /// Cap on the exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Sleeps 1s, 2s, 4s... (per `initial_backoff`/`max_backoff`) between
/// attempts; after `max_attempts` failures the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let result =
            retry_with_backoff(|| async { Ok::<_, String>(42) }, &fast_config(3), "test").await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let mut count = attempts.lock().unwrap();
                    *count += 1;
                    if *count < 3 {
                        Err(format!("attempt {}", *count))
                    } else {
                        Ok(42)
                    }
                }
            },
            &fast_config(3),
            "test",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_after_max_attempts() {
        let result = retry_with_backoff(
            || async { Err::<i32, _>("persistent error") },
            &fast_config(2),
            "test",
        )
        .await;
        assert_eq!(result, Err("persistent error"));
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let start = std::time::Instant::now();
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let _ = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err::<i32, _>("error")
                }
            },
            &fast_config(4),
            "test",
        )
        .await;

        // Waited 10ms + 20ms + 40ms (capped) = 70ms minimum.
        assert!(start.elapsed() >= Duration::from_millis(70));
        assert_eq!(*attempts.lock().unwrap(), 4);
    }
}
