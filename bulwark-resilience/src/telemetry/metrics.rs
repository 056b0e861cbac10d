//! Prometheus Metrics Definitions
//!
//! Metrics are registered on a caller-supplied [`Registry`], so several
//! orchestrators (or tests) can coexist in one process.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

use crate::circuit_breaker::{CircuitListener, CircuitState, CircuitStats};

/// Upstream request latency buckets (seconds)
/// Covers: 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Errors from metric registration or rendering.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to register {name}: {source}")]
    Register {
        name: &'static str,
        #[source]
        source: prometheus::Error,
    },

    #[error("Failed to encode metrics: {0}")]
    Encode(#[source] prometheus::Error),

    #[error("Metrics output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

fn register<C>(registry: &Registry, name: &'static str, collector: C) -> Result<C, MetricsError>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| MetricsError::Register { name, source })?;
    Ok(collector)
}

/// Container for all request-core metrics.
#[derive(Clone)]
pub struct ResilienceMetrics {
    /// Requests by outcome - labels: endpoint, outcome
    pub requests_total: IntCounterVec,

    /// Upstream request duration histogram - labels: endpoint
    pub request_duration_seconds: HistogramVec,

    /// Cache lookups - labels: result (hit/miss)
    pub cache_lookups_total: IntCounterVec,

    /// Retries scheduled - labels: endpoint
    pub retries_total: IntCounterVec,

    /// Calls rejected by local admission control
    pub rate_limited_total: IntCounter,

    /// Breaker state: 0 closed, 1 half-open, 2 open
    pub circuit_state: IntGauge,

    /// Health probes - labels: result (healthy/unhealthy)
    pub health_checks_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Create all metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let build = |name: &'static str, e: prometheus::Error| MetricsError::Register { name, source: e };

        Ok(Self {
            requests_total: register(
                registry,
                "bulwark_requests_total",
                IntCounterVec::new(
                    Opts::new("bulwark_requests_total", "Total orchestrated requests"),
                    &["endpoint", "outcome"],
                )
                .map_err(|e| build("bulwark_requests_total", e))?,
            )?,

            request_duration_seconds: register(
                registry,
                "bulwark_request_duration_seconds",
                HistogramVec::new(
                    HistogramOpts::new(
                        "bulwark_request_duration_seconds",
                        "Upstream request duration in seconds",
                    )
                    .buckets(REQUEST_LATENCY_BUCKETS.to_vec()),
                    &["endpoint"],
                )
                .map_err(|e| build("bulwark_request_duration_seconds", e))?,
            )?,

            cache_lookups_total: register(
                registry,
                "bulwark_cache_lookups_total",
                IntCounterVec::new(
                    Opts::new("bulwark_cache_lookups_total", "Cache lookups by result"),
                    &["result"],
                )
                .map_err(|e| build("bulwark_cache_lookups_total", e))?,
            )?,

            retries_total: register(
                registry,
                "bulwark_retries_total",
                IntCounterVec::new(
                    Opts::new("bulwark_retries_total", "Retries scheduled"),
                    &["endpoint"],
                )
                .map_err(|e| build("bulwark_retries_total", e))?,
            )?,

            rate_limited_total: register(
                registry,
                "bulwark_rate_limited_total",
                IntCounter::new(
                    "bulwark_rate_limited_total",
                    "Calls rejected by local admission control",
                )
                .map_err(|e| build("bulwark_rate_limited_total", e))?,
            )?,

            circuit_state: register(
                registry,
                "bulwark_circuit_state",
                IntGauge::new(
                    "bulwark_circuit_state",
                    "Circuit breaker state (0 closed, 1 half-open, 2 open)",
                )
                .map_err(|e| build("bulwark_circuit_state", e))?,
            )?,

            health_checks_total: register(
                registry,
                "bulwark_health_checks_total",
                IntCounterVec::new(
                    Opts::new("bulwark_health_checks_total", "Health probes by result"),
                    &["result"],
                )
                .map_err(|e| build("bulwark_health_checks_total", e))?,
            )?,
        })
    }

    /// Record a completed request. `duration_secs` is observed only for
    /// requests that reached the upstream.
    pub fn record_request(&self, endpoint: &str, outcome: &str, duration_secs: Option<f64>) {
        self.requests_total
            .with_label_values(&[endpoint, outcome])
            .inc();
        if let Some(secs) = duration_secs {
            self.request_duration_seconds
                .with_label_values(&[endpoint])
                .observe(secs);
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn record_retry(&self, endpoint: &str) {
        self.retries_total.with_label_values(&[endpoint]).inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn set_circuit_state(&self, state: CircuitState) {
        self.circuit_state.set(state.as_gauge());
    }

    pub fn record_health_check(&self, healthy: bool) {
        let result = if healthy { "healthy" } else { "unhealthy" };
        self.health_checks_total.with_label_values(&[result]).inc();
    }
}

impl CircuitListener for ResilienceMetrics {
    fn on_state_change(&self, _from: CircuitState, to: CircuitState, _stats: &CircuitStats) {
        self.set_circuit_state(to);
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics")
            .field("circuit_state", &self.circuit_state.get())
            .field("rate_limited_total", &self.rate_limited_total.get())
            .finish_non_exhaustive()
    }
}

/// Render `registry` in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(MetricsError::Encode)?;
    Ok(String::from_utf8(buffer)?)
}
