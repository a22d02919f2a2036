// src/utils/retry.rs

//! Bounded retry with fixed or exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Retry settings shared by page fetches, downloads and worker creation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Same pause between every attempt.
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
            exponential_backoff: false,
        }
    }

    /// Doubling pause starting at `initial`.
    pub fn exponential(max_attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: initial,
            ..Self::default()
        }
    }

    /// Pause before retry number `attempt` (1-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return self.initial_backoff;
        }

        let backoff_secs = self.initial_backoff.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(backoff_secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut, P>(&self, label: &str, mut op: F, retryable: P) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&AppError) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt) && retryable(&e) => {
                    let backoff = self.calculate_backoff(attempt);
                    log::debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let mut policy = RetryPolicy::exponential(4, Duration::from_secs(1));
        assert_eq!(policy.calculate_backoff(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_backoff(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_backoff(3), Duration::from_secs(4));

        policy.max_backoff = Duration::from_secs(5);
        assert_eq!(policy.calculate_backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(policy.calculate_backoff(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_backoff(3), Duration::from_secs(2));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn run_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        let result: Result<()> = policy
            .run(
                "op",
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::worker("connection reset"))
                },
                AppError::is_transient,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(5, Duration::ZERO);

        let result: Result<()> = policy
            .run(
                "op",
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::config("bad"))
                },
                AppError::is_transient,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_returns_first_success() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let value = policy
            .run(
                "op",
                |attempt| async move {
                    if attempt < 2 {
                        Err(AppError::Pool("busy".into()))
                    } else {
                        Ok(attempt)
                    }
                },
                AppError::is_transient,
            )
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
