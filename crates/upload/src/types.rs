//! Configuration types for the upload flow.

use std::time::Duration;

/// Retry budget and backoff for part uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per part, including the first. Zero counts as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retries without waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Attempt budget, never below one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the given failed attempt (1-based), with ±25% jitter.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered(capped, jitter_unit()))
    }
}

/// Scales `secs` by a factor in [0.75, 1.25) picked by `unit` in [0, 1).
fn jittered(secs: f64, unit: f64) -> f64 {
    let offset = unit * 2.0 - 1.0; // [-1.0, 1.0)
    (secs + secs * 0.25 * offset).max(0.0)
}

/// Pseudo-random value in [0, 1) from the clock's sub-second nanos.
fn jitter_unit() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1_000_000_000.0
}
