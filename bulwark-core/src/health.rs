//! Health check result types
//!
//! A failed probe is data, not an error: every probe outcome, including
//! timeouts and overlapping calls, is reported as a [`HealthCheckResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message carried by the sentinel result returned to overlapping callers.
pub const CHECK_IN_PROGRESS_MESSAGE: &str = "health check already in progress";

/// Immutable snapshot of one liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    /// Probe round-trip time.
    pub latency: Duration,
    pub message: String,
    /// Upstream version, when the probe reports one.
    pub version: Option<String>,
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Create a healthy result.
    pub fn healthy(latency: Duration, message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            timestamp: Utc::now(),
            latency,
            message: message.into(),
            version: None,
            error: None,
        }
    }

    /// Create an unhealthy result.
    pub fn unhealthy(
        latency: Duration,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            healthy: false,
            timestamp: Utc::now(),
            latency,
            message: message.into(),
            version: None,
            error: Some(error.into()),
        }
    }

    /// Sentinel handed to a caller that overlapped an in-flight probe.
    pub fn in_progress() -> Self {
        Self {
            healthy: false,
            timestamp: Utc::now(),
            latency: Duration::ZERO,
            message: CHECK_IN_PROGRESS_MESSAGE.to_string(),
            version: None,
            error: None,
        }
    }

    /// Result for a probe that lost the race against its timer.
    pub fn timed_out(timeout: Duration) -> Self {
        Self::unhealthy(
            timeout,
            "health check timed out",
            format!("no response within {}ms", timeout.as_millis()),
        )
    }

    /// Set the upstream version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether this is the overlapping-call sentinel.
    pub fn is_in_progress_sentinel(&self) -> bool {
        !self.healthy && self.error.is_none() && self.message == CHECK_IN_PROGRESS_MESSAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let ok = HealthCheckResult::healthy(Duration::from_millis(12), "pong").with_version("4.2");
        assert!(ok.healthy);
        assert_eq!(ok.version.as_deref(), Some("4.2"));
        assert!(!ok.is_in_progress_sentinel());

        let bad = HealthCheckResult::unhealthy(Duration::from_millis(3), "probe failed", "503");
        assert!(!bad.healthy);
        assert_eq!(bad.error.as_deref(), Some("503"));
        assert!(!bad.is_in_progress_sentinel());
    }

    #[test]
    fn test_sentinel_and_timeout() {
        let sentinel = HealthCheckResult::in_progress();
        assert!(sentinel.is_in_progress_sentinel());

        let timed_out = HealthCheckResult::timed_out(Duration::from_millis(250));
        assert!(!timed_out.healthy);
        assert!(timed_out.error.as_deref().unwrap_or_default().contains("250ms"));
        assert!(!timed_out.is_in_progress_sentinel());
    }
}
