//! Retry policy: eligibility and exponential backoff with jitter.

use std::time::Duration;

use bulwark_core::constants::{JITTER_MAX_FACTOR, JITTER_MIN_FACTOR};
use bulwark_core::{ApiError, ErrorType, RetryConfig};
use chrono::Utc;
use rand::Rng;

/// Decides whether and when a failed call is retried.
#[derive(Debug, Clone, Default)]
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

    /// Whether to retry after `attempts` failed attempts.
    ///
    /// Rate-limit and server errors are retried until the budget runs out.
    /// Timeouts and network errors are retried only after the first attempt.
    pub fn should_retry(&self, error: &ApiError, attempts: u32) -> bool {
        if self.config.skip_retries || attempts >= self.config.max_retries {
            return false;
        }
        match error.error_type {
            ErrorType::RateLimit | ErrorType::Server => true,
            ErrorType::Timeout | ErrorType::Network => attempts < 1,
            ErrorType::Client
            | ErrorType::CircuitOpen
            | ErrorType::Cancelled
            | ErrorType::Unknown => false,
        }
    }

    /// Backoff before jitter: `initial * multiplier^attempts`, capped.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        self.clamp(self.raw_delay_secs(attempts))
    }

    /// Delay before the next attempt.
    ///
    /// A server retry hint on `error` wins over the computed backoff; either
    /// way the result never exceeds the configured maximum.
    pub fn next_delay(&self, attempts: u32, error: Option<&ApiError>) -> Duration {
        if let Some(hint) = error.and_then(|e| e.retry_after) {
            return hint.delay_from(Utc::now()).min(self.config.max_delay());
        }

        let mut raw = self.raw_delay_secs(attempts);
        if self.config.jitter_enabled {
            raw *= rand::rng().random_range(JITTER_MIN_FACTOR..JITTER_MAX_FACTOR);
        }
        self.clamp(raw)
    }

    /// Uncapped `initial * multiplier^attempts`, in seconds.
    fn raw_delay_secs(&self, attempts: u32) -> f64 {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        self.config.initial_delay().as_secs_f64() * self.config.backoff_multiplier.powi(exponent)
    }

    fn clamp(&self, secs: f64) -> Duration {
        let max = self.config.max_delay();
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::RetryAfter;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_enabled: jitter,
            skip_retries: false,
        })
    }

    #[test]
    fn test_eligibility_by_type() {
        let policy = policy(false);
        assert!(policy.should_retry(&ApiError::server("boom"), 2));
        assert!(policy.should_retry(&ApiError::rate_limit("slow down"), 2));
        assert!(policy.should_retry(&ApiError::timeout("slow"), 0));
        assert!(!policy.should_retry(&ApiError::timeout("slow"), 1));
        assert!(policy.should_retry(&ApiError::network("refused"), 0));
        assert!(!policy.should_retry(&ApiError::network("refused"), 1));
        assert!(!policy.should_retry(&ApiError::client("bad request"), 0));
        assert!(!policy.should_retry(&ApiError::circuit_open("open"), 0));
        assert!(!policy.should_retry(&ApiError::cancelled("gone"), 0));
        assert!(!policy.should_retry(&ApiError::unknown("??"), 0));
    }

    #[test]
    fn test_budget_and_skip_switch() {
        let policy = policy(false);
        assert!(!policy.should_retry(&ApiError::server("boom"), 3));

        let skipping = RetryPolicy::new(RetryConfig {
            skip_retries: true,
            ..RetryConfig::default()
        });
        assert!(!skipping.should_retry(&ApiError::server("boom"), 0));
    }

    #[test]
    fn test_exponential_without_jitter() {
        let policy = policy(false);
        assert_eq!(policy.next_delay(0, None), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1, None), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2, None), Duration::from_secs(4));
        assert_eq!(policy.next_delay(10, None), Duration::from_secs(30));
        assert_eq!(policy.next_delay(u32::MAX, None), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = policy(true);
        for _ in 0..200 {
            let delay = policy.next_delay(1, None);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_retry_after_hint_wins_and_is_clamped() {
        let policy = policy(true);
        let hinted = ApiError::rate_limit("slow down").with_retry_after(RetryAfter::Seconds(7));
        assert_eq!(policy.next_delay(0, Some(&hinted)), Duration::from_secs(7));

        let huge = ApiError::rate_limit("slow down").with_retry_after(RetryAfter::Seconds(3_600));
        assert_eq!(policy.next_delay(0, Some(&huge)), Duration::from_secs(30));

        let past = ApiError::rate_limit("slow down")
            .with_retry_after(RetryAfter::At(Utc::now() - chrono::Duration::seconds(5)));
        assert_eq!(policy.next_delay(0, Some(&past)), Duration::ZERO);
    }

    #[test]
    fn test_base_delay_is_monotonic() {
        let policy = policy(true);
        let mut previous = Duration::ZERO;
        for attempts in 0..20 {
            let delay = policy.base_delay(attempts);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
