//! Sliding-window admission control.
//!
//! One window per key; unkeyed calls share [`DEFAULT_RATE_LIMIT_KEY`]. This
//! guards the process's own outbound budget and runs before any network
//! attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bulwark_core::constants::DEFAULT_RATE_LIMIT_KEY;
use bulwark_core::{ApiError, RateLimitConfig, RateLimitRule};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Admission checks between sweeps of idle windows.
const SWEEP_INTERVAL: u64 = 256;

/// Sliding-window rate limiter keyed by caller or resource.
///
/// Windows that have fully expired are dropped, so the map only holds keys
/// seen within their window.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Admission timestamps per key, oldest first.
    windows: DashMap<String, VecDeque<Instant>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn resolve(key: Option<&str>) -> &str {
        key.unwrap_or(DEFAULT_RATE_LIMIT_KEY)
    }

    fn prune(window: &mut VecDeque<Instant>, rule: &RateLimitRule, now: Instant) {
        let span = rule.window();
        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) >= span {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit one call for `key`, or fail with a RATE_LIMIT error.
    pub fn check_limit(&self, key: Option<&str>) -> Result<(), ApiError> {
        let key = Self::resolve(key);
        let rule = self.config.rule_for(key);
        let now = Instant::now();

        // Must run before the entry guard below is taken.
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep_at(now);
        }

        let mut window = self.windows.entry(key.to_string()).or_default();
        Self::prune(&mut window, &rule, now);

        if window.len() >= rule.max_requests as usize {
            let wait = window
                .front()
                .map(|oldest| rule.window().saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or_else(|| rule.window());
            warn!(
                key,
                max_requests = rule.max_requests,
                wait_ms = wait.as_millis() as u64,
                "Rate limit exceeded"
            );
            return Err(ApiError::rate_limit(format!(
                "Rate limit exceeded for '{}'. Try again in {}ms",
                key,
                wait.as_millis()
            )));
        }

        window.push_back(now);
        debug!(key, used = window.len(), "Rate limit admitted");
        Ok(())
    }

    /// Admissions still available for `key` in the current window.
    pub fn remaining(&self, key: Option<&str>) -> u32 {
        let key = Self::resolve(key);
        let rule = self.config.rule_for(key);
        let now = Instant::now();
        let used = self
            .windows
            .get(key)
            .map(|window| {
                window
                    .iter()
                    .filter(|ts| now.saturating_duration_since(**ts) < rule.window())
                    .count()
            })
            .unwrap_or(0);
        rule.max_requests.saturating_sub(used as u32)
    }

    /// Time until `key` admits again; zero if it would admit now.
    pub fn wait_time(&self, key: Option<&str>) -> Duration {
        let key = Self::resolve(key);
        let rule = self.config.rule_for(key);
        let now = Instant::now();
        let Some(mut window) = self.windows.get_mut(key) else {
            return Duration::ZERO;
        };
        Self::prune(&mut window, &rule, now);
        if window.is_empty() {
            drop(window);
            self.windows.remove_if(key, |_, window| window.is_empty());
            return Duration::ZERO;
        }
        if window.len() < rule.max_requests as usize {
            return Duration::ZERO;
        }
        window
            .front()
            .map(|oldest| rule.window().saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }

    /// Drop every window with no admission left inside it.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|key, window| {
            Self::prune(window, &self.config.rule_for(key), now);
            !window.is_empty()
        });
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            debug!(dropped, "Swept idle rate limit windows");
        }
    }

    /// Keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Clear one key's window.
    pub fn reset(&self, key: Option<&str>) {
        self.windows.remove(Self::resolve(key));
    }

    /// Clear every window.
    pub fn reset_all(&self) {
        self.windows.clear();
    }
}
