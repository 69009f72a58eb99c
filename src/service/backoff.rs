use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffStrategy, ReconnectPolicy};

/// Base delay before reconnect attempt `attempt` (1-based), without jitter.
///
/// Exponential: `initial * multiplier^(attempt-1)`, capped at `max_interval`.
/// Linear: `initial * attempt`, capped at `max_interval`.
pub fn base_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let initial = policy.initial_interval;
    let base = match policy.backoff_strategy {
        BackoffStrategy::Exponential => {
            let factor = policy.backoff_multiplier.powi((attempt - 1).min(64) as i32);
            initial.mul_f64(factor.min(1e9))
        }
        BackoffStrategy::Linear => {
            initial.saturating_mul(attempt.min(1_000_000))
        }
    };
    base.min(policy.max_interval)
}

/// Delay before reconnect attempt `attempt`, with jitter applied when the
/// policy asks for it: uniform in `[base * 0.5, base * 1.5]`.
pub fn delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = base_delay(policy, attempt);
    if !policy.jitter || base.is_zero() {
        return base;
    }
    let factor = rand::rng().random_range(0.5..=1.5);
    base.mul_f64(factor)
}

/// True once the configured attempt limit is reached (0 = unlimited).
pub fn exhausted(policy: &ReconnectPolicy, attempts_made: u32) -> bool {
    policy.max_attempts > 0 && attempts_made >= policy.max_attempts
}
