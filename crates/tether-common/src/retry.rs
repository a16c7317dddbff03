//! Retry and backoff utilities
//!
//! Two shapes of retrying show up in the syncer:
//!
//! - [`retry_with_backoff`] wraps a single async call and loops until it
//!   succeeds (startup work such as CRD installation).
//! - [`BackoffPolicy`] only computes delays; callers that keep their own
//!   attempt counters (the work queue, the lifecycle error policy) use it to
//!   schedule the next try.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff with a hard cap and optional jitter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any computed delay
    pub cap: Duration,
    /// Multiply each delay by a random factor in `0.5..1.5` (still capped)
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Create a jittered policy with the given base and cap
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: true,
        }
    }

    /// Same policy without jitter; delays become exactly reproducible
    pub fn deterministic(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    ///
    /// `attempt == 0` is treated like the first attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = raw.min(self.cap.as_secs_f64());

        let secs = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            (capped * factor).min(self.cap.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(secs)
    }
}

/// Configuration for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever
    pub fn infinite() -> Self {
        Self::default()
    }

    fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.initial_delay, self.max_delay)
    }
}

/// Execute an async operation, retrying with jittered exponential backoff.
///
/// Returns the last error once `max_attempts` is exhausted (never, when
/// `max_attempts` is 0).
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let policy = config.policy();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
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
    fn test_backoff_doubles_until_cap() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300)).deterministic();

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(9), Duration::from_secs(256));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_attempt_zero_behaves_like_first() {
        let policy = BackoffPolicy::default().deterministic();
        assert_eq!(policy.delay_for(0), policy.delay_for(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(4), Duration::from_secs(10));
        for _ in 0..100 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_secs(2), "{:?}", d);
            assert!(d <= Duration::from_secs(6), "{:?}", d);

            let capped = policy.delay_for(8);
            assert!(capped <= Duration::from_secs(10), "{:?}", capped);
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };

        let result: Result<(), &str> = retry_with_backoff(&config, "install_crd", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("api server not ready")
            }
        })
        .await;

        assert_eq!(result, Err("api server not ready"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };

        let result: Result<u32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }
}
