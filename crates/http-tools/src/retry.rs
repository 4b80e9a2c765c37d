//! Bounded exponential backoff for transient call failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub maximum_attempts: u32,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    #[serde(default)]
    pub maximum_interval_ms: Option<u64>,
    /// Failure categories that must not be retried even if transient
    /// (`timeout`, `transport`, `upstream_5xx`, `rate_limited`).
    #[serde(default)]
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval_ms: 200,
            backoff_coefficient: 2.0,
            maximum_interval_ms: Some(5_000),
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.maximum_attempts.max(1)
    }

    #[must_use]
    pub fn disallows(&self, category: &str) -> bool {
        self.non_retryable_error_types.iter().any(|t| t == category)
    }

    /// Delay to wait after `attempt` (1-based) failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        retry_delay(
            self.initial_interval_ms,
            self.backoff_coefficient,
            self.maximum_interval_ms,
            attempt,
        )
    }
}

/// Capped exponential backoff: `initial * coefficient^(attempt - 1)`, capped at `maximum_ms`.
///
/// `attempt` starts at 1 for the initial try; the delay after attempt 1 is `initial_ms`.
#[must_use]
pub fn retry_delay(
    initial_ms: u64,
    coefficient: f64,
    maximum_ms: Option<u64>,
    attempt: u32,
) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }
    let exp = attempt.saturating_sub(1).min(30);
    if !coefficient.is_finite() || coefficient <= 0.0 {
        return Duration::from_millis(0);
    }
    let mult = coefficient.powi(i32::try_from(exp).unwrap_or(30));
    if !mult.is_finite() || mult <= 0.0 {
        return Duration::from_millis(0);
    }

    let mut d = Duration::from_millis(initial_ms).mul_f64(mult);
    if let Some(max_ms) = maximum_ms {
        d = d.min(Duration::from_millis(max_ms));
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let p = RetryPolicy {
            maximum_attempts: 5,
            initial_interval_ms: 100,
            backoff_coefficient: 2.0,
            maximum_interval_ms: Some(300),
            non_retryable_error_types: vec!["timeout".to_string()],
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(300));
        assert_eq!(p.delay_after(10), Duration::from_millis(300));
        assert!(p.disallows("timeout"));
        assert!(!p.disallows("transport"));
    }

    #[test]
    fn degenerate_coefficients_do_not_sleep() {
        assert_eq!(retry_delay(100, 0.0, None, 2), Duration::ZERO);
        assert_eq!(retry_delay(100, f64::NAN, None, 2), Duration::ZERO);
        assert_eq!(retry_delay(100, 2.0, None, 0), Duration::ZERO);
    }

    #[test]
    fn none_policy_has_single_attempt() {
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }
}
