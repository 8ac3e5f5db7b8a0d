//! Bounded retry policy for whole upload attempts.

use log::{info, warn};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 9;

/// Default delay between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// `initial * 2^(n-1)` after the n-th failure, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        initial: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            },
        }
    }
}

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_retries(DEFAULT_RETRIES)
    }
}

impl RetryPolicy {
    /// `retries` retries after the first attempt, 1 s apart.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff: Backoff::Fixed(DEFAULT_DELAY),
        }
    }

    /// Set the delay schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total attempts, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay schedule.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `attempt` until it succeeds or the attempts are used up.
    ///
    /// `attempt` receives the 1-based attempt number. Errors that are not
    /// [retryable](Error::is_retryable) stop immediately and are returned as
    /// they are; exhaustion yields [`Error::RetriesExhausted`].
    pub fn run<T, F>(&self, cancel: &CancelToken, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut n = 1;
        loop {
            cancel.check()?;
            if n > 1 {
                info!("Attempt {n}/{}", self.max_attempts);
            }

            let error = match attempt(n) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            warn!("Attempt {n}/{} failed: {error}", self.max_attempts);
            if n >= self.max_attempts {
                return Err(Error::RetriesExhausted {
                    attempts: n,
                    last: Box::new(error),
                });
            }

            cancel.sleep(self.backoff.delay(n))?;
            n += 1;
        }
    }
}
