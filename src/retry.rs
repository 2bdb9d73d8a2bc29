//! Explicit retry combinator with exponential backoff.
//!
//! The orchestrator wraps each harvest attempt in [`retry_with_backoff`];
//! adapters use the same combinator with a smaller policy for transient
//! HTTP failures. Keeping the policy a plain value makes the delay
//! schedule testable without running anything.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::{FetchError, HarvestError};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 5 attempts, 2 s doubling, capped at 30 s.
    pub const fn harvest_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }

    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier: 2,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// The first `max_attempts` entries of the delay sequence.
    ///
    /// Only the first `max_attempts - 1` are slept; the rest of the
    /// sequence shows where the cap takes over.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .map(|n| self.delay_for_retry(n))
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::harvest_default()
    }
}

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for HarvestError {
    fn is_retryable(&self) -> bool {
        HarvestError::is_retryable(self)
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Why the combinator gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error stopped the loop early.
    Aborted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error, or
/// `policy.max_attempts` is reached. The closure receives the 1-based
/// attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "non-retryable error, giving up"
                );
                return Err(RetryError::Aborted {
                    attempts: attempt,
                    error: err,
                });
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_for_retry(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
