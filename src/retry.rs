//! Bounded retry with exponential backoff for remote effects.
//!
//! Every attempt runs under a timeout. Dropping the returned future cancels
//! the operation between attempts or mid-request, so callers persist anything
//! that must outlive a cancelled attempt before awaiting it.

use crate::config::RetryConfig;
use crate::storage::StoreError;
use std::future::Future;
use std::time::Duration;

/// Retry parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            attempt_timeout: config.attempt_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// A remote effect that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt failed with a transient error
    Exhausted { attempts: u32, last: StoreError },
    /// A non-retryable error ended the operation
    Permanent(StoreError),
}

impl RetryError {
    /// The underlying store error.
    pub fn last_error(&self) -> &StoreError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "Gave up after {attempts} attempts: {last}")
            }
            RetryError::Permanent(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RetryError {}

/// What happened on the remote side of an operation whose local part is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEffect {
    /// Nothing needed to happen remotely
    NotRequired,
    /// The remote effect was confirmed, touching this many items
    Applied(usize),
    /// The remote effect could not be confirmed and is still outstanding
    Pending(RetryError),
}

impl RemoteEffect {
    pub fn is_pending(&self) -> bool {
        matches!(self, RemoteEffect::Pending(_))
    }
}

impl From<Result<usize, RetryError>> for RemoteEffect {
    fn from(result: Result<usize, RetryError>) -> Self {
        match result {
            Ok(n) => RemoteEffect::Applied(n),
            Err(e) => RemoteEffect::Pending(e),
        }
    }
}

impl RetryPolicy {
    /// A policy with no delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "timed out after {:?}",
                    self.attempt_timeout
                ))),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Remote operation recovered");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    tracing::warn!(operation, error = %e, "Remote operation failed permanently");
                    return Err(RetryError::Permanent(e));
                }
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(operation, attempt, error = %e, "Remote operation exhausted retries");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(operation, attempt, ?delay, error = %e, "Retrying remote operation");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
