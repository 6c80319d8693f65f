//! Capped exponential backoff

use std::time::Duration;

use runtime_core::{Error, Result, RetryConfig};

/// Bounded retry schedule: `min(base * 2^attempt, max)` before retry `attempt + 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Build a policy. `base_backoff` must be positive and not exceed `max_backoff`.
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Result<Self> {
        if base_backoff.is_zero() {
            return Err(Error::invalid_config("base_backoff must be positive"));
        }
        if max_backoff < base_backoff {
            return Err(Error::invalid_config(format!(
                "max_backoff ({:?}) must not be below base_backoff ({:?})",
                max_backoff, base_backoff
            )));
        }
        Ok(Self {
            max_retries,
            base_backoff,
            max_backoff,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Delay to wait after the failure of zero-based `attempt`.
    ///
    /// Saturates at `max_backoff` instead of overflowing for large attempts.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let scaled = 1u128
            .checked_shl(attempt)
            .and_then(|factor| self.base_backoff.as_nanos().checked_mul(factor));

        match scaled {
            Some(nanos) if nanos < self.max_backoff.as_nanos() => {
                // Below max_backoff, so it fits a Duration.
                let secs = (nanos / 1_000_000_000) as u64;
                let subsec = (nanos % 1_000_000_000) as u32;
                Duration::new(secs, subsec)
            }
            _ => self.max_backoff,
        }
    }

    /// The full sleep schedule, one entry per allowed retry
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(move |attempt| self.backoff_for(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = Error;

    fn try_from(config: &RetryConfig) -> Result<Self> {
        Self::new(config.max_retries, config.base_backoff, config.max_backoff)
    }
}
