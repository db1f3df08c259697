//! Capped exponential backoff for directory calls.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::DirectoryError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_interval: Duration,
    pub factor: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_millis(500),
            factor: 2.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): `base * factor^retry`,
    /// capped at `max_interval`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.base_interval.as_secs_f64() * self.factor.max(1.0).powi(retry as i32);
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T, DirectoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        status = ?err.status(),
                        error = %err,
                        "transient directory error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_interval: Duration::from_millis(1),
            factor: 2.0,
            max_interval: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_interval: Duration::from_millis(100),
            factor: 3.0,
            max_interval: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = fast(3)
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DirectoryError::from_status(502, "bad gateway"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = fast(2)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DirectoryError::Transport("reset".into()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn never_retries_auth() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = fast(5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DirectoryError::from_status(401, "bad signature"))
            })
            .await;
        assert!(out.unwrap_err().is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
