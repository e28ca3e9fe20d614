//! Retry utilities with exponential backoff.
//!
//! Two flavours live here:
//! - [`retry_with_backoff`] for Kubernetes writes and other calls where the
//!   exact delays don't matter and jitter keeps replicas from synchronizing.
//! - [`BackoffSchedule`] for loops that must follow a fixed, observable
//!   sequence of delays (the OpenAPI document fetch).
//!
//! [`retry_deadline`] and [`remaining_until`] persist a requeue delay on a
//! resource status, so a watch event caused by the operator's own status
//! write does not start the next attempt early.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
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

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to `max_attempts` if set) until success and
/// returns the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but an error for which `retryable` returns
/// false is returned at once.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = if config.jitter {
                    let factor = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * factor)
                } else {
                    delay
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Deterministic doubling backoff: `base, 2*base, 4*base, ...` for a fixed
/// number of attempts.
///
/// Iterating yields one delay per attempt. Callers sleep for the yielded
/// delay after each failed attempt, including the last one, so a schedule of
/// 5 attempts with a base of 2s yields 2, 4, 8, 16 and 32 seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffSchedule {
    attempts: u32,
    base: Duration,
}

impl BackoffSchedule {
    /// Create a schedule of `attempts` attempts starting at `base`
    pub fn doubling(attempts: u32, base: Duration) -> Self {
        Self { attempts, base }
    }

    /// Number of attempts in the schedule
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay following the given zero-based attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// All delays in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts).map(|i| self.delay_after(i))
    }
}

/// RFC 3339 time `delay` after `now`, rounded up to the next whole second
pub fn retry_deadline(now: DateTime<Utc>, delay: Duration) -> String {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    let deadline = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
    let rounded = if deadline.timestamp_subsec_nanos() > 0 {
        deadline
            .checked_add_signed(chrono::Duration::seconds(1))
            .unwrap_or(deadline)
    } else {
        deadline
    };
    rounded.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Time left until `deadline`.
///
/// `None` when there is no deadline, it has passed, or it does not parse;
/// in each case the caller may go ahead.
pub fn remaining_until(deadline: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let deadline = DateTime::parse_from_rfc3339(deadline?).ok()?;
    (deadline.with_timezone(&Utc) - now)
        .to_std()
        .ok()
        .filter(|left| !left.is_zero())
}
