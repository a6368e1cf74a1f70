//! Retry decisions and exponential backoff.
//!
//! Pure arithmetic. The state machine owns the rule that a task does not
//! re-enter Running before `nextRetryTime`.

use chrono::{DateTime, Duration, Utc};

use crate::task::RetrySpec;

/// Whether failed attempt number `attempt` (1-indexed) may be retried.
///
/// `max_attempts` counts retries, so 0 makes the first failure final.
pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt >= 1 && attempt <= max_attempts
}

/// Delay before retry `attempt`: `min(initial * 2^(attempt-1), cap)`.
pub fn next_backoff(attempt: u32, initial_secs: u64, cap_secs: u64) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    initial_secs.saturating_mul(factor).min(cap_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        backoff_secs: u64,
        next_retry_time: DateTime<Utc>,
    },
    Exhausted,
}

/// Decide what follows failed attempt `attempt` under `spec`.
pub fn plan_retry(attempt: u32, spec: Option<&RetrySpec>, now: DateTime<Utc>) -> RetryDecision {
    let spec = spec.cloned().unwrap_or_default();
    if !should_retry(attempt, spec.max_attempts) {
        return RetryDecision::Exhausted;
    }
    let backoff_secs = next_backoff(attempt, spec.backoff_seconds, spec.max_backoff_seconds);
    let delay = i64::try_from(backoff_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    RetryDecision::Retry {
        backoff_secs,
        next_retry_time: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}
