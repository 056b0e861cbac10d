//! Bulwark Telemetry - Observability Infrastructure
//!
//! Provides the in-process event collector, Prometheus metrics, and tracing
//! subscriber setup for the request core.

pub mod collector;
pub mod metrics;
pub mod tracer;

pub use collector::{LatencyStats, TelemetryCollector, TelemetrySummary};
pub use metrics::{encode_text, MetricsError, ResilienceMetrics};
pub use tracer::{init_tracing, TracingConfig, TracingError, DEFAULT_LOG_FILTER};
