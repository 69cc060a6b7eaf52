//! Retry wrapper for registry-facing calls (`spec.md` §4.3).
//!
//! Only transient kernel codes are worth retrying; the [`ErrorKind`] produced
//! by [`crate::mapper`] already carries that verdict via
//! [`crate::error::RecoveryHint::recoverable`], so this module just owns the
//! backoff schedule and the retry loop around a closure.

use std::time::Duration;

use rand::Rng;

use crate::{clock::Clock, error::Error};

/// Exponential backoff schedule with jitter, as enumerated in `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Fractional jitter applied symmetrically to each computed delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay to use before the `attempt`th retry (`attempt` is 1-based: the
    /// delay before the first retry is `attempt == 1`).
    fn delay_for(&self, attempt: u32) -> Duration {
        let unjittered = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32 - 1);
        let capped = unjittered.min(self.max_delay.as_secs_f64());
        let jitter = capped * self.jitter_fraction;
        let jittered = rand::thread_rng().gen_range((capped - jitter).max(0.0)..=(capped + jitter));
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op`, retrying per this policy whenever `op`'s error reports
    /// [`Error::is_transient`]. Returns the final error unchanged if the
    /// retry budget is exhausted. Logs one informational line with the
    /// attempt count on success after at least one retry (`spec.md` §4.3).
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        operation: &str,
        mut op: impl FnMut(u32) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{operation} succeeded after retry (attempt = {attempt})");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_transient() || attempt > self.max_retries {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    log::debug!(
                        "{operation} failed on attempt {attempt} ({err}); retrying in {delay:?}"
                    );
                    clock.sleep(delay);
                }
            }
        }
    }
}
