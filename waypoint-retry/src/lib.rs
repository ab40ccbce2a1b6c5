//! Retry and backoff logic for Waypoint storage backends
//!
//! Backends that talk to something that can be momentarily unavailable (a
//! busy SQLite file, a key-value server mid-failover) wrap their calls in
//! [`retry_blocking`] or [`retry_async`]. Errors opt into retrying through
//! [`RetryableError`]; anything permanent is returned on the first attempt.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
#[cfg(feature = "async-rt")]
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classifies errors as worth retrying or not
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// A bounded exponential backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_attempts: usize,
}

impl RetryPolicy {
    /// Build a policy from an exponential backoff schedule and an attempt cap
    pub fn new(backoff: ExponentialBackoff, max_attempts: usize) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(default_backoff_policy(), 1)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn schedule(&self) -> ExponentialBackoff {
        let mut backoff = self.backoff.clone();
        backoff.reset();
        backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_backoff_policy(), 3)
    }
}

/// Decide whether to try again, returning the delay before the next attempt
fn next_delay<E>(
    op_name: &str,
    attempt: usize,
    policy: &RetryPolicy,
    schedule: &mut ExponentialBackoff,
    err: &E,
) -> Option<Duration>
where
    E: RetryableError + Display,
{
    if err.is_permanent() {
        debug!(operation = op_name, attempt, error = %err, "Permanent failure, not retrying");
        return None;
    }
    if attempt >= policy.max_attempts {
        warn!(
            operation = op_name,
            attempt,
            error = %err,
            "Operation exhausted retry attempts"
        );
        return None;
    }
    let delay = schedule.next_backoff()?;
    warn!(
        operation = op_name,
        attempt,
        max_attempts = policy.max_attempts,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %err,
        "Transient failure, retrying"
    );
    Some(delay)
}

/// Run a blocking operation, retrying transient failures with backoff
///
/// The closure receives the 1-based attempt number. The last error is
/// returned once the policy gives up.
pub fn retry_blocking<F, T, E>(op_name: &'static str, policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut(usize) -> Result<T, E>,
    E: RetryableError + Display,
{
    let mut schedule = policy.schedule();
    let mut attempt = 1;

    loop {
        match f(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => match next_delay(op_name, attempt, policy, &mut schedule, &err) {
                Some(delay) => {
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}

/// Run an async operation, retrying transient failures with backoff
#[cfg(feature = "async-rt")]
pub async fn retry_async<F, Fut, T, E>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    let mut schedule = policy.schedule();
    let mut attempt = 1;

    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => match next_delay(op_name, attempt, policy, &mut schedule, &err) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for networked key-value stores
pub fn network_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(1.5)
        .build()
}

/// Backoff policy for local storage operations (shorter timeouts)
pub fn local_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_interval(Duration::from_millis(500))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .with_multiplier(2.0)
        .build()
}
