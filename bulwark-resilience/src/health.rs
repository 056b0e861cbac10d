//! Liveness probing of the content source.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bulwark_core::{classify, HealthCheckConfig, HealthCheckResult};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::source::ContentSource;

/// Clears the in-flight flag when the probe finishes or is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Health checker with an in-flight fast-fail guard.
///
/// At most one probe runs at a time. A call that overlaps a running probe
/// gets [`HealthCheckResult::in_progress`] back immediately instead of
/// waiting for it.
pub struct HealthChecker {
    source: Arc<dyn ContentSource>,
    config: HealthCheckConfig,
    in_flight: AtomicBool,
    probes: AtomicU64,
    last_check: RwLock<Option<HealthCheckResult>>,
}

impl HealthChecker {
    pub fn new(source: Arc<dyn ContentSource>, config: HealthCheckConfig) -> Self {
        Self {
            source,
            config,
            in_flight: AtomicBool::new(false),
            probes: AtomicU64::new(0),
            last_check: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    fn store(&self, result: &HealthCheckResult) {
        *self
            .last_check
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
    }

    /// Probe the source once.
    pub async fn check(&self) -> HealthCheckResult {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(source = self.source.name(), "Health check already in progress");
            return HealthCheckResult::in_progress();
        }
        let _guard = InFlightGuard(&self.in_flight);
        self.probes.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let outcome = self.source.ping().await;
        let latency = started.elapsed();

        let result = match outcome {
            Ok(ping) => {
                let message = ping.message.unwrap_or_else(|| "ok".to_string());
                let result = HealthCheckResult::healthy(latency, message);
                match ping.version {
                    Some(version) => result.with_version(version),
                    None => result,
                }
            }
            Err(err) => {
                let err = classify(err, None);
                HealthCheckResult::unhealthy(latency, "upstream unreachable", err.to_string())
            }
        };

        if result.healthy {
            debug!(
                source = self.source.name(),
                latency_ms = latency.as_millis() as u64,
                "Health check passed"
            );
        } else {
            warn!(
                source = self.source.name(),
                error = result.error.as_deref().unwrap_or_default(),
                "Health check failed"
            );
        }
        self.store(&result);
        result
    }

    /// [`check`](Self::check) raced against `timeout`.
    ///
    /// When the timer wins the probe is dropped and a timed-out result is
    /// recorded as the latest check.
    pub async fn check_with_timeout(&self, timeout: Duration) -> HealthCheckResult {
        match tokio::time::timeout(timeout, self.check()).await {
            Ok(result) => result,
            Err(_) => {
                let result = HealthCheckResult::timed_out(timeout);
                warn!(
                    source = self.source.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Health check timed out"
                );
                self.store(&result);
                result
            }
        }
    }

    /// Run [`check`](Self::check) up to `max_attempts` times, `delay` apart.
    ///
    /// Returns the first healthy result, or the last failure.
    pub async fn check_retry(&self, max_attempts: u32, delay: Duration) -> HealthCheckResult {
        self.retry_loop(max_attempts, delay, None).await
    }

    /// The configured probe: up to `max_attempts` checks, `retry_delay`
    /// apart, each bounded by `timeout`.
    pub async fn check_configured(&self) -> HealthCheckResult {
        self.retry_loop(
            self.config.max_attempts,
            self.config.retry_delay(),
            Some(self.config.timeout()),
        )
        .await
    }

    async fn retry_loop(
        &self,
        max_attempts: u32,
        delay: Duration,
        timeout: Option<Duration>,
    ) -> HealthCheckResult {
        let attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match timeout {
                Some(timeout) => self.check_with_timeout(timeout).await,
                None => self.check().await,
            };
            if result.healthy || attempt >= attempts {
                return result;
            }
            debug!(
                source = self.source.name(),
                attempt,
                max_attempts = attempts,
                "Health check failed, retrying"
            );
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// The most recent completed probe, if any.
    pub fn last_check(&self) -> Option<HealthCheckResult> {
        self.last_check
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a probe is currently running.
    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Probes actually sent to the source.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("source", &self.source.name())
            .field("in_flight", &self.is_checking())
            .field("probes", &self.probe_count())
            .finish()
    }
}
