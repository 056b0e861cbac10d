//! Error classification.
//!
//! Turns whatever the content source reported into a typed [`ApiError`].
//! Structured status information wins; the message text is only consulted
//! when the transport gave us nothing better.

use crate::error::{ApiError, ErrorType, RetryAfter};

/// Message fragments that identify a timeout.
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];

/// Message fragments that identify a connection-level failure.
const NETWORK_MARKERS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "enotfound",
    "getaddrinfo",
    "dns",
    "name resolution",
    "network",
    "socket hang up",
];

/// Unstructured failure as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFailure {
    /// HTTP status, when the transport exposes one.
    pub status: Option<u16>,
    pub message: String,
    /// Raw `Retry-After` header value.
    pub retry_after: Option<String>,
}

impl RawFailure {
    /// A failure with an HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// A failure with only a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

/// What a content source hands back on failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    Raw(RawFailure),
    /// Already typed; classification passes it through unchanged.
    Classified(ApiError),
    /// The caller's cancellation signal fired.
    Cancelled,
}

impl From<RawFailure> for SourceError {
    fn from(raw: RawFailure) -> Self {
        SourceError::Raw(raw)
    }
}

impl From<ApiError> for SourceError {
    fn from(err: ApiError) -> Self {
        SourceError::Classified(err)
    }
}

/// Classify a source failure.
///
/// Pure and idempotent: an already classified error is returned as is.
pub fn classify(error: SourceError, endpoint: Option<&str>) -> ApiError {
    let classified = match error {
        SourceError::Classified(err) => return err,
        SourceError::Cancelled => ApiError::cancelled("request cancelled by caller"),
        SourceError::Raw(raw) => classify_raw(raw),
    };
    match endpoint {
        Some(endpoint) => classified.with_endpoint(endpoint),
        None => classified,
    }
}

fn classify_raw(raw: RawFailure) -> ApiError {
    if let Some(status) = raw.status {
        if let Some(err) = classify_status(status, &raw) {
            return err;
        }
    }

    let message = raw.message;
    let lowered = message.to_lowercase();
    let base = if TIMEOUT_MARKERS.iter().any(|m| lowered.contains(m)) {
        ApiError::timeout(message)
    } else if NETWORK_MARKERS.iter().any(|m| lowered.contains(m)) {
        ApiError::network(message)
    } else {
        ApiError::unknown(message)
    };
    match raw.status {
        Some(status) => base.with_status(status),
        None => base,
    }
}

fn classify_status(status: u16, raw: &RawFailure) -> Option<ApiError> {
    let message = if raw.message.is_empty() {
        format!("HTTP {}", status)
    } else {
        raw.message.clone()
    };

    let err = match status {
        429 => {
            let err = ApiError::new(ErrorType::RateLimit, message).with_status(status);
            match raw.retry_after.as_deref().and_then(RetryAfter::parse) {
                Some(hint) => err.with_retry_after(hint),
                None => err,
            }
        }
        500..=599 => ApiError::new(ErrorType::Server, message).with_status(status),
        400..=499 => ApiError::new(ErrorType::Client, message).with_status(status),
        _ => return None,
    };
    Some(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_429_is_retryable_rate_limit() {
        let raw = RawFailure::http(429, "slow down").with_retry_after("3");
        let err = classify(raw.into(), Some("posts"));
        assert_eq!(err.error_type, ErrorType::RateLimit);
        assert!(err.retryable);
        assert_eq!(err.status_code, Some(429));
        assert_eq!(err.retry_after, Some(RetryAfter::Seconds(3)));
        assert_eq!(err.endpoint.as_deref(), Some("posts"));
    }

    #[test]
    fn test_unparseable_retry_after_is_dropped() {
        let raw = RawFailure::http(429, "").with_retry_after("whenever");
        let err = classify(raw.into(), None);
        assert_eq!(err.retry_after, None);
        assert_eq!(err.message, "HTTP 429");
    }

    #[test]
    fn test_server_and_client_statuses() {
        let err = classify(RawFailure::http(503, "unavailable").into(), None);
        assert_eq!(err.error_type, ErrorType::Server);
        assert!(err.retryable);

        let err = classify(RawFailure::http(404, "missing").into(), None);
        assert_eq!(err.error_type, ErrorType::Client);
        assert!(!err.retryable);
    }

    #[test]
    fn test_status_beats_message_text() {
        let err = classify(RawFailure::http(400, "request timeout in query").into(), None);
        assert_eq!(err.error_type, ErrorType::Client);
    }

    #[test]
    fn test_message_fallback() {
        let err = classify(RawFailure::transport("operation timed out").into(), None);
        assert_eq!(err.error_type, ErrorType::Timeout);
        assert!(err.retryable);

        let err = classify(RawFailure::transport("connect ECONNREFUSED 10.0.0.1:443").into(), None);
        assert_eq!(err.error_type, ErrorType::Network);

        let err = classify(RawFailure::transport("getaddrinfo ENOTFOUND cms").into(), None);
        assert_eq!(err.error_type, ErrorType::Network);

        let err = classify(RawFailure::transport("something odd").into(), None);
        assert_eq!(err.error_type, ErrorType::Unknown);
        assert!(!err.retryable);
    }

    #[test]
    fn test_unmapped_status_uses_message() {
        let err = classify(RawFailure::http(302, "redirect loop").into(), None);
        assert_eq!(err.error_type, ErrorType::Unknown);
        assert_eq!(err.status_code, Some(302));
    }

    #[test]
    fn test_classified_passes_through_unchanged() {
        let original = ApiError::server("boom").with_status(502);
        let again = classify(SourceError::Classified(original.clone()), Some("other"));
        assert_eq!(again, original);
    }

    #[test]
    fn test_cancelled() {
        let err = classify(SourceError::Cancelled, Some("search"));
        assert_eq!(err.error_type, ErrorType::Cancelled);
        assert!(!err.retryable);
    }
}
