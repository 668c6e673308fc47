use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::error::SendError;

const INITIAL_INTERVAL: Duration = Duration::from_secs(1);
const MAXIMUM_INTERVAL: Duration = Duration::from_secs(20);
const BACKOFF_COEFFICIENT: u32 = 2;

#[derive(Clone, Copy, Debug)]
enum Budget {
    Bounded(u32),
    Unbounded { delivery_timeout: Duration },
}

/// Capped exponential backoff over a fallible send. Bounded mode
/// counts attempts; unbounded mode (`retries == MAX`) runs until
/// `delivery.timeout.ms` has elapsed since the first attempt.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    budget: Budget,
}

impl RetryPolicy {
    pub fn bounded(retries: u32) -> Self {
        Self {
            budget: Budget::Bounded(retries),
        }
    }

    pub fn unbounded(delivery_timeout: Duration) -> Self {
        Self {
            budget: Budget::Unbounded { delivery_timeout },
        }
    }

    pub fn from_config(retries: u32, delivery_timeout: Duration) -> Self {
        if retries == u32::MAX {
            Self::unbounded(delivery_timeout)
        } else {
            Self::bounded(retries)
        }
    }

    fn retry_interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let candidate = INITIAL_INTERVAL * BACKOFF_COEFFICIENT.pow(exponent);
        candidate.min(MAXIMUM_INTERVAL)
    }

    fn exhausted(&self, attempt: u32, started: Instant) -> bool {
        match self.budget {
            Budget::Bounded(max) => attempt > max,
            Budget::Unbounded { delivery_timeout } => started.elapsed() >= delivery_timeout,
        }
    }

    /// Runs `send` until it succeeds, hits a non-recoverable error, or
    /// exhausts the retry budget. `send` is invoked once per attempt so it
    /// can rebuild whatever per-attempt state the broker client needs.
    pub async fn send_with_retry<F, Fut, T>(&self, mut send: F) -> Result<T, SendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SendError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match send().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_recoverable() {
                        error!(attempt, %error, "non-recoverable send error, not retrying");
                        return Err(error);
                    }
                    if self.exhausted(attempt, started) {
                        error!(attempt, %error, "retry budget exhausted");
                        return Err(error);
                    }
                    let interval = self.retry_interval(attempt);
                    warn!(attempt, ?interval, %error, "retrying send after backoff");
                    tokio::time::sleep(interval).await;
                }
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
    fn retry_interval_doubles_up_to_the_cap() {
        let policy = RetryPolicy::bounded(10);
        assert_eq!(policy.retry_interval(1), Duration::from_secs(1));
        assert_eq!(policy.retry_interval(2), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(3), Duration::from_secs(4));
        assert_eq!(policy.retry_interval(6), Duration::from_secs(20));
        assert_eq!(policy.retry_interval(20), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_zero_nacks_on_first_failure() {
        let policy = RetryPolicy::bounded(0);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), SendError> = policy
            .send_with_retry(|| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(SendError::Retryable("boom".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_two_exhausts_after_three_attempts() {
        let policy = RetryPolicy::bounded(2);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), SendError> = policy
            .send_with_retry(|| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(SendError::Retryable("boom".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_errors_are_never_retried() {
        let policy = RetryPolicy::bounded(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), SendError> = policy
            .send_with_retry(|| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(SendError::RecordTooLarge) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_the_send_stops_failing() {
        let policy = RetryPolicy::bounded(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = policy
            .send_with_retry(|| {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SendError::Retryable("boom".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
