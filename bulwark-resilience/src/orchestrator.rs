//! Request orchestration around a single upstream.
//!
//! Order of operations per call: cache lookup, rate-limit admission, circuit
//! admission (with a recovery health check right after OPEN expires), the
//! call itself, then classification and retry. Successful responses are
//! cached with dependency keys derived from their shape.

use std::sync::Arc;
use std::time::Duration;

use bulwark_core::constants::DEFAULT_RATE_LIMIT_KEY;
use bulwark_core::{
    classify, ApiError, BulwarkResult, ErrorType, HealthCheckResult, ResilienceConfig,
};
use bulwark_storage::{CacheStats, DependencyCache, DependencyExtractor, ShapeExtractor};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitAdmission, CircuitBreaker, CircuitStats};
use crate::health::HealthChecker;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::source::{ContentSource, SourceRequest};
use crate::telemetry::{ResilienceMetrics, TelemetryCollector, TelemetrySummary};

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// A successful orchestrated call.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratedResponse {
    pub value: Value,
    /// Key the response is (or would be) cached under.
    pub cache_key: String,
    pub from_cache: bool,
    /// Upstream attempts made; zero for a cache hit.
    pub attempts: u32,
    pub latency: Duration,
}

/// Snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub source: String,
    pub circuit: CircuitStats,
    pub cache: CacheStats,
    pub telemetry: TelemetrySummary,
    pub last_health_check: Option<HealthCheckResult>,
    /// Admissions left in the default rate-limit window.
    pub rate_limit_remaining: u32,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Composes cache, rate limiter, circuit breaker, health checker and retry
/// policy around one [`ContentSource`].
///
/// Every component is owned by the instance; separate orchestrators share
/// nothing unless a cache is passed in explicitly.
pub struct Orchestrator {
    source: Arc<dyn ContentSource>,
    config: ResilienceConfig,
    cache: Arc<DependencyCache>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    health: HealthChecker,
    telemetry: Arc<TelemetryCollector>,
    extractor: Arc<dyn DependencyExtractor>,
    metrics: Option<Arc<ResilienceMetrics>>,
}

impl Orchestrator {
    /// Build an orchestrator. Fails if `config` does not validate.
    pub fn new(source: Arc<dyn ContentSource>, config: ResilienceConfig) -> BulwarkResult<Self> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::named(
            source.name().to_string(),
            config.circuit_breaker.clone(),
        ));
        let telemetry = Arc::new(TelemetryCollector::new(config.telemetry_capacity));
        breaker.add_listener(telemetry.clone());

        Ok(Self {
            health: HealthChecker::new(source.clone(), config.health.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            cache: Arc::new(DependencyCache::new()),
            extractor: Arc::new(ShapeExtractor),
            metrics: None,
            source,
            config,
            breaker,
            telemetry,
        })
    }

    /// Use a shared cache instead of a private one.
    pub fn with_cache(mut self, cache: Arc<DependencyCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the default [`ShapeExtractor`].
    pub fn with_extractor(mut self, extractor: Arc<dyn DependencyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Report to Prometheus metrics as well.
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        metrics.set_circuit_state(self.breaker.state());
        self.breaker.add_listener(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DependencyCache> {
        &self.cache
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn health_checker(&self) -> &HealthChecker {
        &self.health
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    /// Execute a request and return its payload.
    pub async fn execute(&self, request: SourceRequest) -> Result<Value, ApiError> {
        self.execute_detailed(request).await.map(|response| response.value)
    }

    /// Execute a request and report how it was served.
    pub async fn execute_detailed(
        &self,
        request: SourceRequest,
    ) -> Result<OrchestratedResponse, ApiError> {
        let request_id = Uuid::now_v7();
        let span = tracing::debug_span!(
            "orchestrate",
            %request_id,
            endpoint = %request.endpoint,
            source = self.source.name()
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: SourceRequest) -> Result<OrchestratedResponse, ApiError> {
        let started = Instant::now();
        let cache_key = request.resolved_cache_key();

        if request.is_cancelled() {
            return Err(self.fail(&request, cancelled(&request), started, 0));
        }

        // 1. Cache
        if !request.bypass_cache {
            if let Some(value) = self.lookup(&cache_key) {
                let latency = started.elapsed();
                self.telemetry
                    .record_request_success(&request.endpoint, latency, 0, true);
                if let Some(metrics) = &self.metrics {
                    metrics.record_request(&request.endpoint, "cache_hit", None);
                }
                return Ok(OrchestratedResponse {
                    value,
                    cache_key,
                    from_cache: true,
                    attempts: 0,
                    latency,
                });
            }
        }

        // 2. Local admission control
        if let Err(err) = self.limiter.check_limit(request.caller.as_deref()) {
            let key = request.caller.as_deref().unwrap_or(DEFAULT_RATE_LIMIT_KEY);
            self.telemetry.record_rate_limited(key);
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited();
            }
            return Err(self.fail(&request, err, started, 0));
        }

        let mut attempts: u32 = 0;
        loop {
            if request.is_cancelled() {
                return Err(self.fail(&request, cancelled(&request), started, attempts));
            }

            // 3. Circuit admission
            if let Err(err) = self.admit().await {
                return Err(self.fail(&request, err, started, attempts));
            }

            // 4. The call
            attempts += 1;
            let err = match self.call_source(&request).await {
                Ok(value) => {
                    self.breaker.record_success();
                    if !request.bypass_cache {
                        self.store(&request, &cache_key, &value);
                    }
                    let latency = started.elapsed();
                    self.telemetry
                        .record_request_success(&request.endpoint, latency, attempts, false);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_request(
                            &request.endpoint,
                            "success",
                            Some(latency.as_secs_f64()),
                        );
                    }
                    return Ok(OrchestratedResponse {
                        value,
                        cache_key,
                        from_cache: false,
                        attempts,
                        latency,
                    });
                }
                Err(err) => err,
            };

            // 5. Failure handling
            if err.error_type == ErrorType::Cancelled {
                return Err(self.fail(&request, err, started, attempts));
            }
            if err.error_type.counts_as_circuit_failure() {
                self.breaker.record_failure();
            }

            let retries_so_far = attempts - 1;
            if !self.retry.should_retry(&err, retries_so_far) {
                if retries_so_far > 0 {
                    warn!(
                        endpoint = %request.endpoint,
                        attempts,
                        error_type = %err.error_type,
                        "Retries exhausted"
                    );
                }
                return Err(self.fail(&request, err, started, attempts));
            }

            let delay = self.retry.next_delay(retries_so_far, Some(&err));
            debug!(
                endpoint = %request.endpoint,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error_type = %err.error_type,
                "Retrying request"
            );
            self.telemetry
                .record_retry(&request.endpoint, attempts, delay, &err);
            if let Some(metrics) = &self.metrics {
                metrics.record_retry(&request.endpoint);
            }

            if !sleep_unless_cancelled(&request, delay).await {
                return Err(self.fail(&request, cancelled(&request), started, attempts));
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let found = match self.cache.get(key) {
            Ok(found) => found,
            Err(err) => {
                warn!(key, error = %err, "Cache lookup failed");
                None
            }
        };
        match &found {
            Some(_) => {
                debug!(key, "Serving from cache");
                self.telemetry.record_cache_hit(key);
            }
            None => self.telemetry.record_cache_miss(key),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(found.is_some());
        }
        found
    }

    fn store(&self, request: &SourceRequest, key: &str, value: &Value) {
        let dependencies = self.extractor.dependencies(key, value);
        let ttl = self.config.cache.ttl_for(request.ttl_class);
        if let Err(err) = self.cache.set(key, value.clone(), ttl, dependencies) {
            warn!(key, error = %err, "Failed to cache response");
        }
    }

    /// Circuit admission, including the recovery probe on the first call
    /// after the breaker leaves OPEN. No caller reaches the upstream while
    /// that probe is unsettled.
    async fn admit(&self) -> Result<(), ApiError> {
        match self.breaker.poll_and_transition() {
            CircuitAdmission::Closed | CircuitAdmission::HalfOpen { run_probe: false } => Ok(()),
            CircuitAdmission::Open { retry_in } => Err(ApiError::circuit_open(format!(
                "Circuit breaker is OPEN. Next attempt in {}ms",
                retry_in.as_millis()
            ))),
            CircuitAdmission::Probing => Err(ApiError::circuit_open(
                "Circuit breaker recovery check in progress",
            )),
            CircuitAdmission::HalfOpen { run_probe: true } => {
                let probe = self.breaker.probe_guard();
                let result = self.run_health_check().await;
                if result.healthy {
                    probe.pass();
                    return Ok(());
                }
                // A sentinel means the probe never ran; dropping the guard
                // leaves it for the next caller.
                if !result.is_in_progress_sentinel() {
                    probe.fail();
                }
                Err(ApiError::circuit_open(format!(
                    "Circuit breaker recovery check failed: {}",
                    result.error.as_deref().unwrap_or(&result.message)
                )))
            }
        }
    }

    async fn call_source(&self, request: &SourceRequest) -> Result<Value, ApiError> {
        let timeout = self.config.request_timeout();
        let call = tokio::time::timeout(timeout, self.source.fetch(request));

        let outcome = match &request.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(cancelled(request)),
                outcome = call => outcome,
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(err, Some(&request.endpoint))),
            Err(_) => Err(ApiError::timeout(format!(
                "Request to '{}' timed out after {}ms",
                request.endpoint,
                timeout.as_millis()
            ))
            .with_endpoint(request.endpoint.clone())),
        }
    }

    /// One bounded probe; recovery admission does not retry it.
    async fn run_health_check(&self) -> HealthCheckResult {
        let result = self
            .health
            .check_with_timeout(self.config.health.timeout())
            .await;
        self.record_health(&result);
        result
    }

    fn record_health(&self, result: &HealthCheckResult) {
        if result.is_in_progress_sentinel() {
            return;
        }
        self.telemetry.record_health(result);
        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(result.healthy);
        }
    }

    /// Record a surfaced failure and hand it back.
    fn fail(
        &self,
        request: &SourceRequest,
        err: ApiError,
        started: Instant,
        attempts: u32,
    ) -> ApiError {
        let err = if err.endpoint.is_none() {
            err.with_endpoint(request.endpoint.clone())
        } else {
            err
        };
        let latency = started.elapsed();
        self.telemetry
            .record_request_failure(&request.endpoint, &err, latency, attempts);
        if let Some(metrics) = &self.metrics {
            let duration = (attempts > 0).then(|| latency.as_secs_f64());
            metrics.record_request(&request.endpoint, err.error_type.as_str(), duration);
        }
        debug!(
            endpoint = %request.endpoint,
            error_type = %err.error_type,
            attempts,
            "Request failed"
        );
        err
    }

    // ========================================================================
    // PASS-THROUGHS
    // ========================================================================

    /// Cascading invalidation of one cache key.
    pub fn invalidate(&self, key: &str) -> BulwarkResult<usize> {
        self.cache.invalidate(key)
    }

    /// Cascading invalidation of every key tagged with `entity_type`.
    pub fn invalidate_by_entity_type(&self, entity_type: &str) -> BulwarkResult<usize> {
        self.cache.invalidate_by_entity_type(entity_type)
    }

    /// Probe the upstream now with the configured attempts, delay and
    /// per-attempt timeout.
    pub async fn health_check(&self) -> HealthCheckResult {
        let result = self.health.check_configured().await;
        self.record_health(&result);
        result
    }

    pub fn status(&self) -> BulwarkResult<OrchestratorStatus> {
        Ok(OrchestratorStatus {
            source: self.source.name().to_string(),
            circuit: self.breaker.stats(),
            cache: self.cache.stats()?,
            telemetry: self.telemetry.summary(),
            last_health_check: self.health.last_check(),
            rate_limit_remaining: self.limiter.remaining(None),
        })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("source", &self.source.name())
            .field("breaker", &self.breaker)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

fn cancelled(request: &SourceRequest) -> ApiError {
    ApiError::cancelled(format!("Request to '{}' was cancelled", request.endpoint))
        .with_endpoint(request.endpoint.clone())
}

/// Sleep for `delay`; false if the request was cancelled first.
async fn sleep_unless_cancelled(request: &SourceRequest, delay: Duration) -> bool {
    match &request.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
