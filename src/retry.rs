//! Retry and backoff policy.
//!
//! `RetryPolicy` turns an attempt number into a wait: exponential growth from
//! `initial_delay`, capped at `max_delay`, perturbed by ±10% jitter so that
//! clients reconnecting to the same server do not retry in lockstep.
//!
//! The policy is pure. The random source is passed in by the caller and the
//! wait itself is performed by a [`Sleeper`], so both can be replaced in tests.

use std::time::Duration;

use rand::Rng;

use crate::error::{ClientError, Result};

/// Fraction of the base delay used as the jitter bound in either direction.
pub const JITTER_RATIO: f64 = 0.1;

/// Retry tuning, fixed for the lifetime of a client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts per operation (including the first).
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the unjittered delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            exponential_base: 2.0,
        }
    }
}

/// Validated exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Validate `config` and build a policy from it.
    pub fn new(config: RetryConfig) -> Result<Self> {
        if config.max_retries < 1 {
            return Err(ClientError::invalid_input("max_retries must be at least 1"));
        }
        if config.initial_delay.is_zero() {
            return Err(ClientError::invalid_input("initial_delay must be positive"));
        }
        if config.max_delay < config.initial_delay {
            return Err(ClientError::invalid_input(format!(
                "max_delay ({:?}) must not be shorter than initial_delay ({:?})",
                config.max_delay, config.initial_delay
            )));
        }
        if !config.exponential_base.is_finite() || config.exponential_base <= 1.0 {
            return Err(ClientError::invalid_input(format!(
                "exponential_base must be a finite number greater than 1, got {}",
                config.exponential_base
            )));
        }
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Unjittered delay for a 1-based `attempt`: `initial * base^(attempt-1)`,
    /// capped at `max_delay`. Attempt 0 is treated as attempt 1.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let growth = self.config.exponential_base.powi(exponent);
        let raw = self.config.initial_delay.as_secs_f64() * growth;
        // powi overflows to +inf for large attempts; min() folds that into the cap
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }

    /// Jittered delay for a 1-based `attempt`, drawn from `rng`.
    ///
    /// The result lies within ±10% of [`base_delay`](Self::base_delay) and is
    /// never negative.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = rng.gen_range(-JITTER_RATIO..=JITTER_RATIO) * base;
        Duration::try_from_secs_f64((base + jitter).max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Blocks the calling thread for a backoff delay.
pub trait Sleeper: Send {
    fn sleep(&self, delay: Duration);
}

/// Default sleeper: `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}
