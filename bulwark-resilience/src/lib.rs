//! Bulwark Resilience - the resilient request core.
//!
//! Turns one unreliable, rate-limited upstream content API into a dependable
//! internal service:
//! - `RateLimiter` - sliding-window admission control
//! - `RetryPolicy` - exponential backoff with jitter
//! - `CircuitBreaker` - failure detection and lazy recovery
//! - `HealthChecker` - liveness probing with an in-flight fast-fail guard
//! - `TelemetryCollector` / `ResilienceMetrics` - observability
//! - `Orchestrator` - composes all of the above with the dependency cache
//!   from `bulwark-storage`

pub mod circuit_breaker;
pub mod health;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod source;
pub mod telemetry;

pub use circuit_breaker::{
    CircuitAdmission, CircuitBreaker, CircuitListener, CircuitState, CircuitStats, ProbeGuard,
};
pub use health::HealthChecker;
pub use orchestrator::{OrchestratedResponse, Orchestrator, OrchestratorStatus};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use source::{ContentSource, PingResponse, SourceRequest};
pub use telemetry::{
    encode_text, init_tracing, LatencyStats, MetricsError, ResilienceMetrics, TelemetryCollector,
    TelemetrySummary, TracingConfig, TracingError,
};

// Re-export the shared types callers need alongside the orchestrator.
pub use bulwark_core::{
    ApiError, BulwarkError, BulwarkResult, ErrorType, HealthCheckResult, RawFailure,
    ResilienceConfig, SourceError, TtlClass,
};
