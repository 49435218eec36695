//! Retry policy for operation states.
//!
//! Stateless: all logic lives in associated functions that take the retry
//! configuration as a parameter. The same exponential schedule is reused by
//! the webhook notifier.

use std::time::Duration;

use stepflow_types::workflow::RetryConfig;

/// Stateless retry handler for operation failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Effective attempt budget: the configured `max_attempts` (at least 1),
    /// or a single attempt when no retry block is declared.
    pub fn max_attempts(config: Option<&RetryConfig>) -> u32 {
        config.map(|c| c.max_attempts.max(1)).unwrap_or(1)
    }

    /// Determine whether another attempt should be made.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(config: Option<&RetryConfig>, attempt: u32) -> bool {
        attempt < Self::max_attempts(config)
    }

    /// Delay before attempt `attempt + 1`:
    /// `initial_backoff_ms * multiplier^(attempt-1)`, capped at `max_backoff_ms`.
    pub fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
        let multiplier = if config.multiplier.is_finite() && config.multiplier >= 1.0 {
            config.multiplier
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = config.initial_backoff_ms as f64 * multiplier.powi(exponent);
        let capped = delay.min(config.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Doubling backoff `initial * 2^(attempt-1)`, capped at `max`.
pub fn exponential_backoff(initial_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(32);
    let delay = initial_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(max_ms))
}
