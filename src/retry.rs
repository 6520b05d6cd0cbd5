//! Retry decisions for failed adapter calls.
//!
//! The policy is a pure function of the error and the number of attempts
//! already made; the only impurity is the jitter drawn by [`RetryPolicy::decide`],
//! which [`RetryPolicy::decide_with_jitter`] takes as an argument instead.

use crate::adapter::{AdapterError, ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const JITTER_MIN: f64 = 0.5;
pub const JITTER_MAX: f64 = 1.5;

/// Longest server-requested wait that is honoured; larger hints are cut
/// down to this.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Terminal,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what to do after the `attempt_count`-th failed attempt.
    pub fn decide(&self, error: &AdapterError, attempt_count: u32) -> RetryDecision {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        self.decide_with_jitter(error, attempt_count, jitter)
    }

    pub fn decide_with_jitter(
        &self,
        error: &AdapterError,
        attempt_count: u32,
        jitter: f64,
    ) -> RetryDecision {
        match error.kind {
            ErrorKind::Fatal => RetryDecision::Terminal,
            ErrorKind::Transient if attempt_count >= self.config.max_attempts => {
                RetryDecision::Terminal
            }
            ErrorKind::Transient => {
                let delay = self.backoff(attempt_count, jitter);
                // a server-provided hint wins over our own schedule
                let delay = error
                    .retry_after
                    .map_or(delay, |hint| delay.max(hint.min(MAX_RETRY_AFTER)));
                RetryDecision::Retry(delay)
            }
        }
    }

    /// `base_delay * 2^attempt_count * jitter`, capped at `max_delay`.
    pub fn backoff(&self, attempt_count: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        let factor = 2f64.powi(attempt_count.min(62) as i32);
        let secs = self.config.base_delay.as_secs_f64() * factor * jitter;
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        })
    }

    #[test]
    fn test_fatal_is_terminal_immediately() {
        let error = AdapterError::fatal("event not found");
        assert_eq!(policy().decide(&error, 0), RetryDecision::Terminal);
        assert_eq!(policy().decide(&error, 1), RetryDecision::Terminal);
    }

    #[test]
    fn test_transient_retries_until_max_attempts() {
        let policy = policy();
        let error = AdapterError::transient("HTTP 429");
        for attempt in 0..5 {
            assert!(matches!(
                policy.decide(&error, attempt),
                RetryDecision::Retry(_)
            ));
        }
        assert_eq!(policy.decide(&error, 5), RetryDecision::Terminal);
        assert_eq!(policy.decide(&error, 6), RetryDecision::Terminal);
    }

    #[test]
    fn test_expected_delay_is_non_decreasing_and_capped() {
        let policy = policy();
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let expected = policy.backoff(attempt, 1.0);
            assert!(expected >= previous);
            assert!(expected <= Duration::from_secs(2));
            previous = expected;
        }
        assert_eq!(policy.backoff(11, 1.0), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = policy();
        assert_eq!(policy.backoff(2, 0.5), Duration::from_millis(200));
        assert_eq!(policy.backoff(2, 1.0), Duration::from_millis(400));
        assert_eq!(policy.backoff(2, 1.5), Duration::from_millis(600));
        // out-of-range jitter is clamped
        assert_eq!(policy.backoff(2, 9.0), Duration::from_millis(600));

        let error = AdapterError::transient("HTTP 503");
        for _ in 0..100 {
            match policy.decide(&error, 3) {
                RetryDecision::Retry(delay) => {
                    assert!(delay >= Duration::from_millis(400));
                    assert!(delay <= Duration::from_millis(1200));
                }
                RetryDecision::Terminal => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        assert_eq!(policy().backoff(u32::MAX, 1.5), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_after_hint_extends_delay() {
        let error =
            AdapterError::transient("HTTP 429").with_retry_after(Duration::from_secs(5));
        assert_eq!(
            policy().decide_with_jitter(&error, 1, 1.0),
            RetryDecision::Retry(Duration::from_secs(5))
        );

        let short = AdapterError::transient("HTTP 429").with_retry_after(Duration::from_millis(1));
        assert_eq!(
            policy().decide_with_jitter(&short, 1, 1.0),
            RetryDecision::Retry(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_retry_after_hint_is_bounded() {
        let error = AdapterError::transient("HTTP 429").with_retry_after(Duration::MAX);
        assert_eq!(
            policy().decide_with_jitter(&error, 1, 1.0),
            RetryDecision::Retry(MAX_RETRY_AFTER)
        );
    }
}
