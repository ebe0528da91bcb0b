use serde::{Deserialize, Serialize};

/// Retry policy the task runner applies to failed job attempts.
/// Lock contention is not a failure and never consumes an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub initial_interval_ms: i64,
    pub max_interval_ms: Option<i64>,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: None,
            backoff_factor: Self::default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    pub fn default_attempts() -> u32 {
        3
    }
    pub fn default_initial_interval_ms() -> i64 {
        1_000
    }
    pub fn default_backoff_factor() -> f64 {
        2.0
    }

    /// True when `attempt` (1-based) is the last one this policy permits.
    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt >= self.attempts.max(1)
    }
}

/// Compute the time (epoch ms) for the next attempt, if any.
/// - `failure_time_ms`: time the last attempt failed
/// - `attempt`: the 1-based attempt that just failed
/// Returns None once `attempt` has reached the policy's cap.
pub fn next_retry_time_ms(failure_time_ms: i64, attempt: u32, policy: &RetryPolicy) -> Option<i64> {
    if policy.is_last_attempt(attempt) {
        return None;
    }

    // delay_n = initial * factor^n where n = failures so far minus one
    let exponent = attempt.saturating_sub(1) as i32;
    let mut delay =
        (policy.initial_interval_ms as f64 * policy.backoff_factor.powi(exponent)).round() as i64;
    if let Some(max_interval) = policy.max_interval_ms {
        delay = delay.min(max_interval);
    }
    Some(failure_time_ms.saturating_add(delay.max(0)))
}
