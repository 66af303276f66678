//! Retry Policies - Exponential backoff inside a single step
//!
//! A [`RetryPolicy`] attached to a step re-runs the step's operation when it
//! fails with a matching error kind. All attempts happen inside one step
//! invocation, so history records exactly one outcome per step: the first
//! success, or the last failure once retries are exhausted.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  step("charge", op)                                      │
//! │  • no record → run op                                    │
//! └─────────────┬────────────────────────────────────────────┘
//!               │ op failed with kind K
//!               ↓
//! ┌──────────────────────────────────────────────────────────┐
//! │  RetryPolicy                                             │
//! │  • error_kinds: ["States.ALL"]  (K must match)           │
//! │  • max_attempts: 3   (retries after the first attempt)   │
//! │  • interval_seconds: 1.0                                 │
//! │  • backoff_rate: 2.0                                     │
//! └─────────────┬────────────────────────────────────────────┘
//!               │
//!               ↓ n-th retry waits
//! ┌──────────────────────────────────────────────────────────┐
//! │  delay = interval × backoff_rate ^ (n - 1)               │
//! │  delay = min(delay, max_interval)       (if set)         │
//! │  if jitter: delay *= random(0.5..1.5)                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use durable_core::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3)
//!     .with_error_kinds(["Throttled", "TimeoutError"])
//!     .with_interval(2.0)
//!     .with_backoff_rate(2.0);
//!
//! assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
//! assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
//! assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
//! assert!(policy.matches("Throttled"));
//! assert!(!policy.matches("ValidationError"));
//! ```
//!
//! # Don't retry when
//!
//! - Errors are permanent (validation errors, declined payments)
//! - The operation is not idempotent and a partial side effect is possible
//!
//! Suspensions and fatal engine errors are never retried regardless of the
//! configured kinds.

use crate::error::{kinds, DurableError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_error_kinds() -> Vec<String> {
    vec![kinds::ALL.to_string()]
}

fn default_interval() -> f64 {
    1.0
}

fn default_backoff_rate() -> f64 {
    2.0
}

/// Retry configuration for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Error kinds that trigger a retry (`States.ALL` matches any)
    #[serde(default = "default_error_kinds")]
    pub error_kinds: Vec<String>,

    /// Number of retries after the first attempt
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,

    /// Multiplier applied to the delay after each retry
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,

    /// Upper bound for a single delay, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_seconds: Option<f64>,

    /// Whether to add random jitter to delays
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a policy retrying any recordable error up to `max_attempts` times
    pub fn new(max_attempts: u32) -> Self {
        Self {
            error_kinds: default_error_kinds(),
            max_attempts,
            interval_seconds: default_interval(),
            backoff_rate: default_backoff_rate(),
            max_interval_seconds: None,
            jitter: false,
        }
    }

    /// Restrict retries to the given error kinds
    pub fn with_error_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Set the delay before the first retry
    pub fn with_interval(mut self, seconds: f64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    /// Set the backoff rate
    pub fn with_backoff_rate(mut self, rate: f64) -> Self {
        self.backoff_rate = rate;
        self
    }

    /// Cap each delay
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval_seconds = Some(seconds);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether `kind` is covered by this policy
    pub fn matches(&self, kind: &str) -> bool {
        self.error_kinds
            .iter()
            .any(|candidate| candidate == kinds::ALL || candidate == kind)
    }

    /// Delay before the `retry`-th retry (1-indexed).
    ///
    /// `interval_seconds * backoff_rate ^ (retry - 1)`, capped at
    /// `max_interval_seconds`, with optional jitter. Whatever the inputs, the
    /// result never exceeds [`MAX_RETRY_DELAY_SECONDS`].
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base_delay = self.interval_seconds * self.backoff_rate.powi(exponent);
        let capped_delay = match self.max_interval_seconds {
            Some(max) => base_delay.min(max),
            None => base_delay,
        };

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        let seconds = if final_delay.is_nan() {
            0.0
        } else {
            final_delay.clamp(0.0, MAX_RETRY_DELAY_SECONDS)
        };
        Duration::from_secs_f64(seconds)
    }

    /// Whether another retry is allowed after `retries_done` retries failed with `error`
    pub fn should_retry(&self, error: &DurableError, retries_done: u32) -> bool {
        retries_done < self.max_attempts && error.is_recordable() && self.matches(error.kind())
    }
}

/// Upper bound on a single retry delay (one year)
pub const MAX_RETRY_DELAY_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Attempt tracking for one step invocation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Number of attempts made so far
    pub attempts: u32,

    /// Last error message
    pub last_error: Option<String>,
}

impl RetryState {
    /// Create a new retry state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: &DurableError) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
    }

    /// Retries performed so far (attempts after the first)
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.interval_seconds, 1.0);
        assert_eq!(policy.backoff_rate, 2.0);
        assert_eq!(policy.error_kinds, vec!["States.ALL".to_string()]);
        assert!(!policy.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5).with_interval(1.5).with_backoff_rate(2.0);

        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 1.5);
        assert_eq!(policy.calculate_delay(2).as_secs_f64(), 3.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 6.0);
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_interval(10.0)
            .with_backoff_rate(2.0)
            .with_max_interval(50.0);

        // 10 * 2^5 = 320, capped
        assert_eq!(policy.calculate_delay(6).as_secs_f64(), 50.0);
    }

    #[test]
    fn test_huge_retry_index_is_clamped() {
        let ceiling = Duration::from_secs_f64(MAX_RETRY_DELAY_SECONDS);
        let policy = RetryPolicy::new(100).with_interval(1.0).with_backoff_rate(2.0);

        assert_eq!(policy.calculate_delay(70), ceiling);
        // 2^1100 is infinite as f64
        assert_eq!(policy.calculate_delay(1100), ceiling);
        assert_eq!(policy.calculate_delay(u32::MAX), ceiling);
        assert_eq!(policy.with_jitter(true).calculate_delay(2000), ceiling);

        let shrinking = RetryPolicy::new(100).with_interval(1.0).with_backoff_rate(0.0);
        assert_eq!(shrinking.calculate_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5).with_interval(1.0).with_jitter(true);
        for _ in 0..20 {
            let delay = policy.calculate_delay(3).as_secs_f64();
            assert!((2.0..=6.0).contains(&delay));
        }
    }

    #[test]
    fn test_should_retry_respects_kinds_and_budget() {
        let policy = RetryPolicy::new(2).with_error_kinds(["Throttled"]);
        let throttled = DurableError::operation("Throttled", "slow down");
        let other = DurableError::operation("Declined", "no");

        assert!(policy.should_retry(&throttled, 0));
        assert!(policy.should_retry(&throttled, 1));
        assert!(!policy.should_retry(&throttled, 2));
        assert!(!policy.should_retry(&other, 0));
    }

    #[test]
    fn test_never_retries_control_errors() {
        let policy = RetryPolicy::new(5);
        let suspended = DurableError::Suspended(Default::default());
        let fatal = DurableError::Fatal("store down".into());
        assert!(!policy.should_retry(&suspended, 0));
        assert!(!policy.should_retry(&fatal, 0));
    }

    #[test]
    fn test_retry_state() {
        let mut state = RetryState::new();
        assert_eq!(state.retries(), 0);

        state.record_failure(&DurableError::failed("first"));
        state.record_failure(&DurableError::failed("second"));
        assert_eq!(state.attempts, 2);
        assert_eq!(state.retries(), 1);
        assert_eq!(state.last_error.as_deref(), Some("OperationError: second"));
    }
}
