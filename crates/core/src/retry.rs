use crate::error::Retryable;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for calls to the record store and the workflow control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed once the first attempt has failed
    pub max_retries: u32,
    /// Sleep before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single sleep
    pub max_backoff: Duration,
    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
    /// Time budget of a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Policy that gives every operation exactly one attempt, still bounded by
    /// `attempt_timeout`
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Sleep before retry `attempt + 1`: `initial_backoff * backoff_multiplier^attempt`,
    /// never more than `max_backoff`
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay).map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or runs out of retries.
///
/// Each attempt is bounded by `attempt_timeout`; an attempt that overruns
/// counts as a retryable timeout.
pub async fn retry_transient<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;

    loop {
        let result = match tokio::time::timeout(config.attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out()),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempts < config.max_retries && e.is_retryable() => {
                let backoff = config.backoff_for_attempt(attempts);
                warn!(
                    operation = operation,
                    attempt = attempts + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
