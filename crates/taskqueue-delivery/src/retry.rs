//! Backoff calculation with jitter.
//!
//! Two schedules live here: the exponential policy driving broker-level
//! webhook redelivery, and the linear schedule the executor uses between
//! task attempts. Both add random jitter so synchronized failures do not
//! retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Retry policy for broker-level webhook redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum queue attempts per delivery record (including the first).
    pub max_attempts: u32,

    /// Base delay for the exponential backoff calculation.
    pub base_delay: Duration,

    /// Ceiling on any single delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            jitter_factor: 0.25, // ±25% randomization
        }
    }
}

impl RetryPolicy {
    /// Delay before queue attempt `next_attempt` (1-based), or `None` when
    /// the ceiling is reached and the delivery should be abandoned.
    ///
    /// Doubles per attempt from `base_delay`, capped at `max_delay`, then
    /// jittered.
    pub fn delay_before(&self, next_attempt: u32) -> Option<Duration> {
        if next_attempt > self.max_attempts {
            return None;
        }
        let exponent = next_attempt.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let base = self.base_delay.saturating_mul(multiplier);
        let capped = std::cmp::min(base, self.max_delay);
        Some(std::cmp::min(
            apply_jitter(capped, self.jitter_factor),
            self.max_delay,
        ))
    }
}

/// Linear task-attempt backoff: `retry_delay * attempt`, jittered ±25%.
pub fn task_retry_delay(retry_delay_secs: u32, attempt: u32) -> Duration {
    let base = Duration::from_secs(u64::from(retry_delay_secs) * u64::from(attempt));
    apply_jitter(base, 0.25)
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±`jitter_factor`. With jitter_factor=0.25, a 10s
/// delay becomes 7.5s to 12.5s.
pub fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
