//! Bounded exponential backoff used by the producer when a key queue is full.
//!
//! Produces the wait before each retry of a non-blocking enqueue. The defaults
//! give 100ms, 150ms, 225ms, 337.5ms, 506.25ms and then stop.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Factor applied to the delay after every retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
    /// Retries allowed before giving up.
    pub max_attempts: u32,
    /// Jitter percentage (0.0 to 1.0). Zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 1.5,
            max_interval: Duration::from_secs(5),
            max_attempts: 5,
            jitter_factor: 0.0,
        }
    }
}

impl ExponentialBackoff {
    /// Starts a fresh backoff sequence.
    pub fn start(&self) -> Backoff<'_> {
        Backoff { policy: self, attempt: 0 }
    }

    /// Delay before retry number `attempt` (0-based), ignoring the attempt
    /// limit and jitter.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
        let initial_ns = self.initial_interval.as_nanos() as f64;
        let max_ns = self.max_interval.as_nanos() as f64;
        let nanos = (initial_ns * self.multiplier.max(1.0).powi(exponent)).min(max_ns).round();
        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

/// In-progress backoff sequence.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a ExponentialBackoff,
    attempt: u32,
}

impl Backoff<'_> {
    /// Delay before the next retry, or `None` once the attempt limit is
    /// reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.interval_for(self.attempt);
        self.attempt += 1;
        Some(apply_jitter(delay, self.policy.jitter_factor).min(self.policy.max_interval))
    }

    /// Retries handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Randomizes `duration` by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
