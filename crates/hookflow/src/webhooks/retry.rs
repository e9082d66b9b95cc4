use chrono::{DateTime, Duration, Utc};

use crate::webhooks::model::AttemptStatus;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_BACKOFF_SECS: [i64; 3] = [60, 300, 900];

/// Per-webhook retry policy: total attempts allowed and the wait before each
/// retry. `backoff[n - 1]` is the wait after attempt `n` fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_secs: Vec<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn from_columns(max_attempts: i32, backoff_seconds: &[i32]) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_secs: backoff_seconds.iter().map(|s| i64::from(*s).max(0)).collect(),
        }
    }

    pub fn backoff_columns(&self) -> Vec<i32> {
        self.backoff_secs
            .iter()
            .map(|s| (*s).clamp(0, i64::from(i32::MAX)) as i32)
            .collect()
    }

    /// Wait before the attempt after `attempt_number`, or `None` once the
    /// policy is exhausted. A short list repeats its last entry.
    pub fn delay_after(&self, attempt_number: i32) -> Option<Duration> {
        if attempt_number >= self.max_attempts {
            return None;
        }
        let idx = (attempt_number.max(1) - 1) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(0);
        Some(Duration::seconds(secs))
    }

    pub fn next_retry_at(&self, attempt_number: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.delay_after(attempt_number).map(|d| now + d)
    }
}

/// Outcome class for an HTTP status. Any 2xx is a success; everything else,
/// 4xx included, is retried.
pub fn classify_status(status: u16) -> AttemptStatus {
    if (200..300).contains(&status) {
        AttemptStatus::Success
    } else {
        AttemptStatus::FailedRetryable
    }
}
