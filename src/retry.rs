//! Bounded retry around a single fallible network operation.
//!
//! A [`RetryPolicy`] is a plain value (attempt budget plus backoff shape);
//! what happens between attempts is supplied by a [`RetryHook`], so the
//! same policy serves both searches (reauth on expiry) and token refresh
//! (no hook, no delay).
use crate::error::SyncError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry right away.
    Immediate,
    /// Sleep `base * 2^n` before retry `n` (n starts at 1).
    Exponential { base: Duration },
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Exponential { base } => base.saturating_mul(1u32 << retry.min(16)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Error)]
pub enum RetryError {
    /// `last` is the final attempt's failure as a `TransientNetwork` error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: SyncError },
    #[error(transparent)]
    Aborted(#[from] SyncError),
}

/// Runs between a failed attempt and the backoff sleep. Returning an error
/// aborts the retry loop.
#[async_trait]
pub trait RetryHook: Send + Sync {
    async fn before_retry(&self, retry: u32, err: &anyhow::Error) -> Result<(), SyncError>;
}

pub struct NoopHook;

#[async_trait]
impl RetryHook for NoopHook {
    async fn before_retry(&self, _retry: u32, _err: &anyhow::Error) -> Result<(), SyncError> {
        Ok(())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        hook: &dyn RetryHook,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempts = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempts += 1;
            if attempts >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: SyncError::TransientNetwork(err),
                });
            }
            let delay = self.backoff.delay(attempts);
            warn!(
                operation,
                attempt = attempts,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                err = %format!("{err:#}"),
                "attempt failed; retrying"
            );
            hook.before_retry(attempts, &err).await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
