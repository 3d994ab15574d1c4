use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

use super::LogError;

/// Errors that may clear up if the operation is tried again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for LogError {
    fn is_transient(&self) -> bool {
        matches!(self, LogError::Transient(_))
    }
}

/// Bounded exponential backoff for transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Fails on the first error.
    pub const NONE: Self = RetryPolicy {
        max_retries: 0,
        initial_backoff: Duration::ZERO,
    };

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Runs `op`, retrying transient failures up to `max_retries` times.
    /// Non-transient errors are returned immediately.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempts < self.max_retries => {
                    attempts += 1;
                    let delay = self.backoff(attempts);
                    warn!(
                        op = what,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(op = what, error = %e, "Exhausted retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let out = quick(3)
            .run("produce", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LogError::Transient("queue full".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), _> = quick(2)
            .run("produce", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LogError::Transient("broker down".into()))
            })
            .await;
        assert!(matches!(out, Err(LogError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), _> = quick(5)
            .run("produce", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LogError::Fatal("bad topic".into()))
            })
            .await;
        assert_eq!(out, Err(LogError::Fatal("bad topic".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, PartialEq)]
    struct Flaky(bool);

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky({})", self.0)
        }
    }

    #[tokio::test]
    async fn any_error_type_can_drive_retries() {
        let calls = &AtomicU32::new(0);
        let out = quick(3)
            .run("fetch", || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Flaky(true)),
                    1 => Err(Flaky(false)),
                    _ => Ok(()),
                }
            })
            .await;
        assert_eq!(out, Err(Flaky(false)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
