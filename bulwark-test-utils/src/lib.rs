//! Bulwark Test Utilities
//!
//! Centralized test infrastructure for the bulwark workspace:
//! - A scripted mock content source
//! - Proptest generators for errors, configs and cache keys
//! - Test fixtures for common scenarios
//! - Custom assertions for request outcomes

// Re-export core types for convenience
pub use bulwark_core::{
    ApiError, BulwarkError, BulwarkResult, CircuitBreakerConfig, ErrorType, HealthCheckConfig,
    RateLimitConfig, RateLimitRule, RawFailure, ResilienceConfig, RetryConfig, SourceError,
    TtlClass,
};
pub use bulwark_resilience::{ContentSource, PingResponse, SourceRequest};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK CONTENT SOURCE
// ============================================================================

/// One scripted answer to a fetch or ping.
#[derive(Debug, Clone)]
pub enum MockReply<T> {
    Ok(T),
    Fail(SourceError),
    /// Never completes; used to exercise timeouts and cancellation.
    Hang,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Script<T> {
    queued: VecDeque<MockReply<T>>,
    fallback: MockReply<T>,
}

impl<T: Clone> Script<T> {
    fn new(fallback: MockReply<T>) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback,
        }
    }

    fn next(&mut self) -> MockReply<T> {
        self.queued
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

async fn play<T>(reply: MockReply<T>, delay: Duration) -> Result<T, SourceError> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    match reply {
        MockReply::Ok(value) => Ok(value),
        MockReply::Fail(err) => Err(err),
        MockReply::Hang => std::future::pending().await,
    }
}

/// Scripted content source.
///
/// Fetches and pings consume their queued replies in order; once a queue is
/// empty the fallback reply is used for every further call. Every call is
/// counted, and fetched endpoints are recorded.
#[derive(Debug)]
pub struct MockContentSource {
    name: String,
    fetch_script: Mutex<Script<Value>>,
    ping_script: Mutex<Script<PingResponse>>,
    fetch_delay: Duration,
    ping_delay: Duration,
    fetches: AtomicU32,
    pings: AtomicU32,
    seen: Mutex<Vec<String>>,
}

impl Default for MockContentSource {
    fn default() -> Self {
        Self::new("mock")
    }
}

impl MockContentSource {
    /// A source that answers every fetch with `{}` and every ping healthily.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fetch_script: Mutex::new(Script::new(MockReply::Ok(json!({})))),
            ping_script: Mutex::new(Script::new(MockReply::Ok(PingResponse {
                version: Some("1.0.0".to_string()),
                message: None,
            }))),
            fetch_delay: Duration::ZERO,
            ping_delay: Duration::ZERO,
            fetches: AtomicU32::new(0),
            pings: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful fetch.
    pub fn then_value(self, value: Value) -> Self {
        lock(&self.fetch_script).queued.push_back(MockReply::Ok(value));
        self
    }

    /// Queue a failed fetch.
    pub fn then_failure(self, err: impl Into<SourceError>) -> Self {
        lock(&self.fetch_script)
            .queued
            .push_back(MockReply::Fail(err.into()));
        self
    }

    /// Queue a fetch that never completes.
    pub fn then_hang(self) -> Self {
        lock(&self.fetch_script).queued.push_back(MockReply::Hang);
        self
    }

    /// Reply used once the fetch queue is empty.
    pub fn otherwise(self, reply: MockReply<Value>) -> Self {
        lock(&self.fetch_script).fallback = reply;
        self
    }

    /// Queue a ping reply.
    pub fn then_ping(self, reply: MockReply<PingResponse>) -> Self {
        lock(&self.ping_script).queued.push_back(reply);
        self
    }

    /// Ping reply used once the ping queue is empty.
    pub fn ping_otherwise(self, reply: MockReply<PingResponse>) -> Self {
        lock(&self.ping_script).fallback = reply;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    /// Queue more fetch replies on a shared source.
    pub fn push_reply(&self, reply: MockReply<Value>) {
        lock(&self.fetch_script).queued.push_back(reply);
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Endpoints fetched so far, in call order.
    pub fn endpoints(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl ContentSource for MockContentSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen).push(request.endpoint.clone());
        let reply = lock(&self.fetch_script).next();
        play(reply, self.fetch_delay).await
    }

    async fn ping(&self) -> Result<PingResponse, SourceError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let reply = lock(&self.ping_script).next();
        play(reply, self.ping_delay).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for bulwark types.

    use super::*;
    use proptest::prelude::*;

    /// Any error type.
    pub fn arb_error_type() -> impl Strategy<Value = ErrorType> {
        proptest::sample::select(ErrorType::ALL.to_vec())
    }

    /// An error with its type's default retryability.
    pub fn arb_api_error() -> impl Strategy<Value = ApiError> {
        (arb_error_type(), "[a-z ]{1,24}")
            .prop_map(|(error_type, message)| ApiError::new(error_type, message))
    }

    /// An HTTP failure with a status in 400..600.
    pub fn arb_http_failure() -> impl Strategy<Value = RawFailure> {
        (400u16..600, "[a-z ]{0,16}").prop_map(|(status, message)| RawFailure::http(status, message))
    }

    /// A retry config that passes validation.
    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (
            0u32..10,
            1u64..5_000,
            0u64..60_000,
            1.0f64..4.0,
            any::<bool>(),
        )
            .prop_map(
                |(max_retries, initial_delay_ms, extra_ms, backoff_multiplier, jitter_enabled)| {
                    RetryConfig {
                        max_retries,
                        initial_delay_ms,
                        max_delay_ms: initial_delay_ms + extra_ms,
                        backoff_multiplier,
                        jitter_enabled,
                        skip_retries: false,
                    }
                },
            )
    }

    /// A rate-limit rule with a small budget.
    pub fn arb_rate_limit_rule() -> impl Strategy<Value = RateLimitRule> {
        (1u32..50, 1u64..10_000).prop_map(|(max, window)| RateLimitRule::new(max, window))
    }

    /// An entity-style cache key such as `post:17`.
    pub fn arb_entity_key() -> impl Strategy<Value = String> {
        ("(post|page|category|tag|user|media)", 0u32..500)
            .prop_map(|(entity_type, id)| format!("{}:{}", entity_type, id))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Config with short delays and no jitter, suited to paused-clock tests.
    pub fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 1_000,
                success_threshold: 2,
            },
            retry: RetryConfig {
                max_retries: 3,
                initial_delay_ms: 10,
                max_delay_ms: 100,
                backoff_multiplier: 2.0,
                jitter_enabled: false,
                skip_retries: false,
            },
            health: HealthCheckConfig {
                timeout_ms: 100,
                max_attempts: 2,
                retry_delay_ms: 10,
            },
            request_timeout_ms: 1_000,
            ..ResilienceConfig::default()
        }
    }

    /// [`fast_config`] with retries switched off.
    pub fn no_retry_config() -> ResilienceConfig {
        let mut config = fast_config();
        config.retry.skip_retries = true;
        config
    }

    /// A category entity.
    pub fn category(id: u32, name: &str) -> Value {
        json!({"__typename": "Category", "id": id, "name": name})
    }

    /// A post entity embedding its category and author.
    pub fn post(id: u32, category_id: u32, author_id: u32) -> Value {
        json!({
            "__typename": "Post",
            "id": id,
            "title": format!("Post {}", id),
            "category": category(category_id, "news"),
            "author": {"__typename": "User", "id": author_id}
        })
    }

    /// A listing page of posts.
    pub fn post_list(posts: Vec<Value>) -> Value {
        json!({"data": {"posts": posts}})
    }

    pub fn server_error() -> RawFailure {
        RawFailure::http(503, "Service Unavailable")
    }

    pub fn not_found() -> RawFailure {
        RawFailure::http(404, "Not Found")
    }

    pub fn connection_refused() -> RawFailure {
        RawFailure::transport("connect ECONNREFUSED 10.0.0.1:443")
    }

    pub fn too_many_requests(retry_after: &str) -> RawFailure {
        RawFailure::http(429, "Too Many Requests").with_retry_after(retry_after)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on orchestrated request outcomes.

    use super::*;

    /// Assert that a request failed with the given error type.
    #[track_caller]
    pub fn assert_error_type<T: std::fmt::Debug>(result: &Result<T, ApiError>, expected: ErrorType) {
        match result {
            Err(err) if err.error_type == expected => {}
            other => panic!("Expected {} error, got: {:?}", expected, other),
        }
    }

    /// Assert that a request succeeded.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &Result<T, ApiError>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a config passes validation.
    #[track_caller]
    pub fn assert_config_valid(config: &ResilienceConfig) {
        if let Err(e) = config.validate() {
            panic!("Config validation failed: {:?}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
