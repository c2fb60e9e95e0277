//! Bounded retry with exponential backoff
//!
//! Only errors that classify themselves as transient are retried. Used for
//! the audit append, never for the conditional entity write.

use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (3 means at most 4 calls)
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Trait for error classification
pub trait RetryClassifiable {
    /// Whether repeating the same call may succeed
    fn is_retryable(&self) -> bool;
}

/// Execute `operation`, retrying transient failures with exponential backoff.
///
/// Returns the first success, the first permanent error, or the last
/// transient error once attempts are exhausted.
pub async fn execute_with_backoff<F, Fut, T, E>(operation: F, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + RetryClassifiable,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.initial_backoff_ms))
        .with_max_delay(Duration::from_millis(config.max_backoff_ms))
        .with_factor(config.backoff_multiplier as f32)
        .with_max_times(config.max_attempts);

    operation
        .retry(backoff)
        .when(|err: &E| err.is_retryable())
        .notify(|err: &E, delay: Duration| {
            tracing::debug!(
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "transient failure, retrying"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("broken")]
        Broken,
    }

    impl RetryClassifiable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    fn fast_config(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = execute_with_backoff(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok("done")
                }
            },
            &fast_config(3),
        )
        .await;

        assert_eq!(result.expect("should succeed"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = execute_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Broken)
            },
            &fast_config(3),
        )
        .await;

        assert!(matches!(result, Err(TestError::Broken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = execute_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            },
            &fast_config(2),
        )
        .await;

        assert!(matches!(result, Err(TestError::Flaky)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
