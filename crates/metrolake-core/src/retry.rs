//! Bounded retry with exponential backoff for partition operations

use std::fmt::Display;
use std::time::Duration;

use indicatif::ProgressBar;

use crate::shutdown::is_shutdown_requested;

/// Classifies an error as transient (retry) or fatal (give up).
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry policy attached to a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Backoff before the first retry; doubled for each further attempt.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps (tests, dry runs).
    pub const fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::ZERO,
        }
    }

    /// Exponential backoff: base, 2·base, 4·base, ...
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Retry a fallible operation with exponential backoff.
///
/// Retryable errors are logged, shown on the progress bar and retried up to
/// `policy.max_retries` times. Fatal errors and exhaustion return the last
/// error. A pending shutdown stops further attempts.
pub fn retry_with_backoff<T, E>(
    label: &str,
    policy: &RetryPolicy,
    pb: &ProgressBar,
    mut attempt_fn: impl FnMut() -> Result<T, E>,
) -> Result<T, E>
where
    E: Retryable + Display,
{
    let max_retries = policy.max_retries;
    let mut attempt = 0u32;
    loop {
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() && !is_shutdown_requested() => {
                attempt += 1;
                pb.set_message(format!("retry {attempt}/{max_retries}..."));
                log::warn!("{label}: attempt {attempt}/{max_retries} failed: {e}, retrying...");
                std::thread::sleep(policy.backoff_duration(attempt));
            }
            Err(e) => {
                log::debug!("{label}: giving up after {} attempts: {e}", attempt + 1);
                return Err(e);
            }
        }
    }
}
