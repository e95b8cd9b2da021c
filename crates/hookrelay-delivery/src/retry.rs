//! Exponential backoff with additive jitter.
//!
//! The delay before retry `k` (1 for the first retry) is
//!
//! ```text
//! min(base * factor^(k - 1), ceiling) + uniform(0, jitter)
//! ```
//!
//! Jitter is added after the ceiling, so the longest possible wait is
//! `ceiling + jitter`. Retries that have all reached the ceiling still spread
//! out instead of firing together.

use std::time::Duration;

use hookrelay_core::Job;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Attempt budget and backoff parameters for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Multiplier applied for each further retry.
    pub factor: f64,

    /// Upper bound of the uniform jitter added after capping.
    pub jitter: Duration,

    /// Cap applied to the exponential term.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

impl RetryPolicy {
    /// Applies a job's overrides on top of this policy.
    pub fn for_job(&self, job: &Job) -> Self {
        let overrides = &job.backoff;
        Self {
            max_attempts: job.max_attempts.unwrap_or(self.max_attempts).max(1),
            base_delay: overrides.base.map_or(self.base_delay, seconds),
            factor: overrides.factor.unwrap_or(self.factor),
            jitter: overrides.jitter.map_or(self.jitter, seconds),
            max_delay: overrides.max.map_or(self.max_delay, seconds),
        }
    }

    /// Whether a job that has now made `attempts_made` attempts is out of
    /// budget.
    pub const fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    /// Delay before retry number `attempt_index`, drawing jitter from `rng`.
    pub fn next_delay<R: Rng + ?Sized>(&self, attempt_index: u32, rng: &mut R) -> Duration {
        seconds(next_delay(
            self.base_delay.as_secs_f64(),
            self.factor,
            self.jitter.as_secs_f64(),
            self.max_delay.as_secs_f64(),
            attempt_index,
            rng,
        ))
    }
}

/// Backoff delay in seconds before retry number `attempt_index`.
///
/// `attempt_index` is 1 for the first retry; 0 is treated as 1. A
/// non-positive base yields zero before jitter.
pub fn next_delay<R: Rng + ?Sized>(
    base: f64,
    factor: f64,
    jitter_max: f64,
    ceiling: f64,
    attempt_index: u32,
    rng: &mut R,
) -> f64 {
    let exponent = i32::try_from(attempt_index.saturating_sub(1)).unwrap_or(i32::MAX);
    let exponential = if base > 0.0 { base * factor.powi(exponent) } else { 0.0 };
    let capped = if exponential.is_nan() { ceiling } else { exponential.min(ceiling) };

    let jitter = if jitter_max > 0.0 && jitter_max.is_finite() {
        rng.random_range(0.0..=jitter_max)
    } else {
        0.0
    };

    capped.max(0.0) + jitter
}
