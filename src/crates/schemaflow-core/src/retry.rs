//! Retry policies - bounded re-execution of failed steps
//!
//! A step that returns a retryable [`StepError`](crate::StepError) is executed again
//! until its policy's `max_attempts` is reached; the final failure is terminal for the
//! run. Validation rejections are not errors and never reach this layer: they are
//! handled in state by the validation loop.
//!
//! ```text
//! attempt 1 ──fail──▶ sleep(calculate_delay(0)) ──▶ attempt 2 ──fail──▶ ... ──▶ GraphError::NodeExecution
//!     │                                                  │
//!     └──ok──▶ merge + checkpoint                        └──ok──▶ merge + checkpoint
//! ```
//!
//! delay = min(initial × factor^attempt, max_interval), optionally scaled by a random
//! factor in `0.5..=1.5`.
//!
//! ```rust
//! use schemaflow_core::retry::RetryPolicy;
//!
//! // Batch and test runs get one attempt, interactive sessions get three.
//! assert_eq!(RetryPolicy::for_environment(false).max_attempts, 1);
//! assert_eq!(RetryPolicy::for_environment(true).max_attempts, 3);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempt budget and backoff for one step. Intervals are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_interval: f64,
    pub backoff_factor: f64,
    pub max_interval: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
        }
    }

    /// 3 attempts for interactive sessions, 1 for batch and test runs.
    pub fn for_environment(interactive: bool) -> Self {
        Self::new(if interactive { 3 } else { 1 })
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let base_delay = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_interval).max(0.0);

        let final_delay = if self.jitter {
            capped_delay * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Whether another attempt is allowed after `attempts` attempts have run.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Attempts made so far for one step execution.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: usize,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts += 1;
        self.last_error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_interval, 128.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_environment_defaults() {
        assert_eq!(RetryPolicy::for_environment(false).max_attempts, 1);
        assert_eq!(RetryPolicy::for_environment(true).max_attempts, 3);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(100.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0).as_secs_f64(), 1.0);
        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 2.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 8.0);
        assert_eq!(policy.calculate_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(10.0)
            .with_max_interval(50.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(4).as_secs_f64(), 50.0);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3).with_initial_interval(1.0);
        for _ in 0..50 {
            let delay = policy.calculate_delay(0).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay));
        }
    }

    #[test]
    fn test_should_retry_counts_attempts() {
        let policy = RetryPolicy::new(2);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let mut state = RetryState::new();
        state.record_attempt(Some("timeout".into()));
        assert_eq!(state.attempts, 1);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_deserialize_partial_policy() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 4, "jitter": false}"#).unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert!(!policy.jitter);
        assert_eq!(policy.initial_interval, 0.5);
    }
}
