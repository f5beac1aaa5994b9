//! Capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Backoff schedule: `initial * multiplier^n`, capped at `max`, with an
/// optional ceiling on the number of retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            initial: cfg.initial_backoff,
            max: cfg.max_backoff,
            multiplier: 2,
            max_attempts: cfg.max_attempts,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Stateful iterator over a [`RetryPolicy`]'s delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        let factor = self
            .policy
            .multiplier
            .checked_pow(self.attempts)
            .unwrap_or(u32::MAX);
        let delay = self
            .policy
            .initial
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);

        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Retries handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Why [`retry`] gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("giving up after {attempts} retries: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Fatal(E),

    #[error("retry cancelled")]
    Cancelled,
}

/// Runs `op` until it succeeds, retrying errors accepted by `should_retry`
/// after the policy's delay. Cancellation is observed during sleeps.
pub async fn retry<T, E, Op, Pred, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut should_retry: Pred,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Pred: FnMut(&E) -> bool,
{
    let mut backoff = policy.backoff();

    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(RetryError::Fatal(err));
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(RetryError::Exhausted {
                attempts: backoff.attempts(),
                last: err,
            });
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
