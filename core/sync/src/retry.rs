//! Backoff schedule for transient sync failures.
//!
//! Two consumers share one schedule: queued records store the time of their
//! next attempt and are picked up by a later pass, while in-line calls such
//! as conflict pushes sleep and retry through `RetryExecutor`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use offsync_common::{Error, Result};

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt of an in-line call.
    pub max_retries: u32,
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound of any single wait.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread applied to each wait, as a fraction (0.25 = +/- 25%).
    pub jitter: f64,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Deterministic waits.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Wait after the `failures`-th consecutive failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ceiling = self.max_delay.as_secs_f64();
        let mut secs = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(ceiling);

        if self.jitter > 0.0 {
            let spread = self.jitter.min(1.0);
            secs *= 1.0 - spread + rand::random::<f64>() * 2.0 * spread;
        }
        Duration::from_secs_f64(secs.clamp(0.0, ceiling))
    }

    /// Earliest retry of a record that has failed `failures` times.
    pub fn next_attempt_at(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff(failures))
            .ok()
            .and_then(|wait| now.checked_add_signed(wait))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Bound a call by `timeout`, reporting expiry as `Error::Timeout`.
pub async fn with_timeout<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

/// Runs a call in place, sleeping between attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    ///
    /// Only errors for which `Error::is_retryable` holds are retried; the
    /// last error is returned otherwise. `label` names the call in logs.
    pub async fn execute<F, Fut, T>(&self, label: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            let err = match call().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(call = label, failures, "Recovered after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            failures += 1;
            if !err.is_retryable() || failures > self.config.max_retries {
                warn!(call = label, attempts = failures, "Giving up: {}", err);
                return Err(err);
            }

            let wait = self.config.backoff(failures);
            debug!(call = label, attempt = failures, ?wait, "Retrying after: {}", err);
            sleep(wait).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .without_jitter(),
        )
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = RetryConfig::default()
            .with_max_delay(Duration::from_secs(5))
            .without_jitter();
        let waits: Vec<_> = (1..=5).map(|n| config.backoff(n).as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 5, 5]);
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::default().with_initial_delay(Duration::from_secs(8));
        for _ in 0..50 {
            let wait = config.backoff(1).as_secs_f64();
            assert!((6.0..=10.0).contains(&wait), "wait {} out of band", wait);
        }
    }

    #[test]
    fn test_next_attempt_at_follows_backoff() {
        let config = RetryConfig::default().without_jitter();
        let now = Utc::now();
        assert_eq!(config.next_attempt_at(1, now), now + chrono::Duration::seconds(1));
        assert_eq!(config.next_attempt_at(3, now), now + chrono::Duration::seconds(4));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unavailable_backend_recovers() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast(3)
            .execute("push", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Remote {
                        status: 503,
                        message: "unavailable".to_string(),
                    })
                } else {
                    Ok("pushed")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "pushed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast(3)
            .execute("push", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotFound("products/1".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast(2)
            .execute("push", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout(Duration::from_millis(1)))
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
