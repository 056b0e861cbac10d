//! Error types for bulwark operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure category attached to every [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// Connection refused, reset, DNS failure.
    Network,
    /// The upstream did not answer in time.
    Timeout,
    /// Upstream 429, or local admission control rejected the call.
    RateLimit,
    /// Upstream 5xx.
    Server,
    /// Upstream 4xx other than 429. The caller is at fault.
    Client,
    /// The circuit breaker short-circuited the call. No attempt was made.
    CircuitOpen,
    /// The caller cancelled the call.
    Cancelled,
    /// Anything the classifier could not place.
    Unknown,
}

impl ErrorType {
    /// All error types, in declaration order.
    pub const ALL: [ErrorType; 8] = [
        ErrorType::Network,
        ErrorType::Timeout,
        ErrorType::RateLimit,
        ErrorType::Server,
        ErrorType::Client,
        ErrorType::CircuitOpen,
        ErrorType::Cancelled,
        ErrorType::Unknown,
    ];

    /// Stable lowercase label, used for metrics and telemetry keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Server => "server",
            ErrorType::Client => "client",
            ErrorType::CircuitOpen => "circuit_open",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Unknown => "unknown",
        }
    }

    /// Whether an error of this type is evidence that the upstream is unhealthy.
    ///
    /// Client faults, rate limiting, breaker short-circuits and cancellations
    /// say nothing about upstream health and never move the breaker.
    pub fn counts_as_circuit_failure(&self) -> bool {
        matches!(
            self,
            ErrorType::Network | ErrorType::Timeout | ErrorType::Server
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-provided hint about when to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryAfter {
    /// `Retry-After: <seconds>`
    Seconds(u64),
    /// `Retry-After: <HTTP-date>`
    At(DateTime<Utc>),
}

impl RetryAfter {
    /// Parse a `Retry-After` header value.
    ///
    /// Accepts delta-seconds or an IMF-fixdate such as
    /// `Wed, 21 Oct 2015 07:28:00 GMT`. Returns `None` for anything else.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Ok(secs) = value.parse::<u64>() {
            return Some(RetryAfter::Seconds(secs));
        }
        DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|at| RetryAfter::At(at.with_timezone(&Utc)))
    }

    /// Delay this hint asks for, measured from `now`. Past dates yield zero.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            RetryAfter::Seconds(secs) => Duration::from_secs(*secs),
            RetryAfter::At(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// Typed, retryability-annotated failure record.
///
/// Immutable once constructed; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{error_type} error: {message}")]
pub struct ApiError {
    pub error_type: ErrorType,
    pub message: String,
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub endpoint: Option<String>,
    pub retry_after: Option<RetryAfter>,
}

impl ApiError {
    /// Create an error with the default retryability for its type.
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        let retryable = matches!(
            error_type,
            ErrorType::Network | ErrorType::Timeout | ErrorType::RateLimit | ErrorType::Server
        );
        Self {
            error_type,
            message: message.into(),
            status_code: None,
            retryable,
            timestamp: Utc::now(),
            endpoint: None,
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorType::RateLimit, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Server, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Client, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorType::CircuitOpen, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unknown, message)
    }

    /// Attach an HTTP status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Attach the endpoint the failure occurred on.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Attach a server retry hint.
    pub fn with_retry_after(mut self, hint: RetryAfter) -> Self {
        self.retry_after = Some(hint);
        self
    }

    /// Override retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Invalid cache pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all bulwark errors.
#[derive(Debug, Error)]
pub enum BulwarkError {
    #[error("Request failed: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl BulwarkError {
    /// The typed request failure, if this is one.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            BulwarkError::Api(err) => Some(err),
            _ => None,
        }
    }

    /// Shorthand for the [`ErrorType`] of a request failure.
    pub fn error_type(&self) -> Option<ErrorType> {
        self.as_api().map(|err| err.error_type)
    }
}

/// Result type alias for bulwark operations.
pub type BulwarkResult<T> = Result<T, BulwarkError>;

// =============================================================================
// TESTS
// =============================================================================
