//! Bulwark Core - Shared Types
//!
//! Error taxonomy, the error classifier, health and telemetry records, and
//! configuration. Every other bulwark crate depends on this one; it performs
//! no I/O beyond reading a configuration file.

pub mod classify;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod health;

pub use classify::{classify, RawFailure, SourceError};
pub use config::{
    CacheTtlConfig, CircuitBreakerConfig, HealthCheckConfig, RateLimitConfig, RateLimitRule,
    ResilienceConfig, RetryConfig, TtlClass,
};
pub use error::{
    ApiError, BulwarkError, BulwarkResult, ConfigError, ErrorType, RetryAfter, StorageError,
};
pub use event::{TelemetryCategory, TelemetryEvent};
pub use health::{HealthCheckResult, CHECK_IN_PROGRESS_MESSAGE};
