//! Bounded exponential-backoff retry around fallible external calls.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::core::types::RetryAttempt;
use crate::io::config::RetryConfig;

/// Blocks the current thread between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeping.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Failure after the policy gave up, carrying the last error.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each delay is scaled by a uniform factor in `[1 - r, 1 + r]`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Unjittered delay before 1-indexed `attempt`: zero for the first,
    /// `base * 2^(attempt-1)` afterwards, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_ratio <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = self.jitter_ratio.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        nominal.mul_f64(factor)
    }

    /// Call `op` until it succeeds or `max_attempts` calls have failed.
    ///
    /// Returns the outcome plus one [`RetryAttempt`] per call made.
    #[instrument(skip_all, fields(max_attempts = self.max_attempts))]
    pub fn run<T, E, F>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: F,
    ) -> (Result<T, RetryExhausted<E>>, Vec<RetryAttempt>)
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut attempt = 1;
        loop {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                sleeper.sleep(delay);
            }
            match op(attempt) {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        error: None,
                        delay_ms: delay.as_millis() as u64,
                    });
                    return (Ok(value), attempts);
                }
                Err(err) => {
                    warn!(attempt, err = %err, "attempt failed");
                    attempts.push(RetryAttempt {
                        attempt,
                        error: Some(err.to_string()),
                        delay_ms: delay.as_millis() as u64,
                    });
                    if attempt >= max_attempts {
                        let exhausted = RetryExhausted {
                            attempts: attempt,
                            last_error: err,
                        };
                        return (Err(exhausted), attempts);
                    }
                }
            }
            attempt += 1;
        }
    }
}
