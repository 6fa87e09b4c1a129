// Explicit retry policy for calls to external collaborators
//
// Expressed as a policy object composed around operations rather than a
// decorator, so the policy is visible in the call graph and testable
// without the wrapped function.

use crate::core::config::RetryConfig;
use crate::core::errors::{ApiError, ApiResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff with jitter. Only transient error kinds are retried;
/// terminal kinds surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    factor: u32,
    jitter_pct: u32,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.base,
            factor: config.factor.max(1),
            jitter_pct: config.jitter_pct.min(100),
            max_delay: config.max_delay,
        }
    }

    /// Delay before the given retry (attempt is 1-based; attempt 1 is the
    /// first retry). Jittered by +/- jitter_pct around the exponential curve.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        let nominal = self
            .base
            .saturating_mul(exp)
            .min(self.max_delay)
            .as_millis() as u64;
        if self.jitter_pct == 0 || nominal == 0 {
            return Duration::from_millis(nominal);
        }
        let spread = nominal * self.jitter_pct as u64 / 100;
        let low = nominal.saturating_sub(spread);
        let high = nominal + spread;
        let jittered = rand::thread_rng().gen_range(low..=high);
        Duration::from_millis(jittered)
    }

    /// Run `op`, retrying transient failures with backoff. `label` is used
    /// for logging only.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label, attempt, self.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt >= self.max_attempts && err.is_transient() {
                        warn!(
                            "{}: giving up after {} attempts: {}",
                            label, self.max_attempts, err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Classify a reqwest transport failure for retry purposes. Connection
/// faults and timeouts are transient; everything else is terminal.
pub fn classify_reqwest(err: &reqwest::Error, service: &str) -> ApiError {
    if err.is_timeout() {
        return ApiError::timeout(format!("{service} request"));
    }
    let transient = err.is_connect() || err.is_request();
    match service {
        "vision" => ApiError::vision(err.to_string(), transient),
        _ => ApiError::storage(err.to_string(), transient),
    }
}

/// Whether an upstream HTTP status merits a retry.
pub fn status_is_transient(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base: Duration::from_millis(1),
            factor: 2,
            jitter_pct: 0,
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result = fast_policy(5)
            .run("test", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ApiError::storage("connection reset", true))
                    } else {
                        Ok(7u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_surface_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: ApiResult<()> = fast_policy(5)
            .run("test", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::validation("bad input"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: ApiResult<()> = fast_policy(3)
            .run("test", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::vision("503", true))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            factor: 2,
            jitter_pct: 0,
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        // 400ms nominal capped at 350ms
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(200),
            factor: 2,
            jitter_pct: 25,
            max_delay: Duration::from_secs(10),
        };
        for _ in 0..50 {
            let d = policy.delay_for(1).as_millis() as u64;
            assert!((150..=250).contains(&d), "jittered delay {} out of band", d);
        }
    }

    #[test]
    fn status_classification() {
        assert!(status_is_transient(500));
        assert!(status_is_transient(503));
        assert!(status_is_transient(429));
        assert!(!status_is_transient(404));
        assert!(!status_is_transient(400));
    }
}
