//! Bounded telemetry event log with derived statistics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bulwark_core::constants::{DEFAULT_LATENCY_SAMPLES, DEFAULT_TELEMETRY_CAPACITY};
use bulwark_core::{ApiError, ErrorType, HealthCheckResult, TelemetryCategory, TelemetryEvent};
use serde::Serialize;

use crate::circuit_breaker::{CircuitListener, CircuitState, CircuitStats};

// ============================================================================
// SUMMARY TYPES
// ============================================================================

/// Latency distribution over the retained samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let total: Duration = sorted.iter().sum();
        Self {
            samples: sorted.len(),
            avg: total / sorted.len() as u32,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Aggregate view of everything recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Failed share of all requests (0.0 to 1.0).
    pub error_rate: f64,
    /// Requests rejected by an open breaker. Not part of the request totals.
    pub short_circuited: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub circuit_transitions: u64,
    pub errors_by_type: BTreeMap<String, u64>,
    /// Latency of requests that reached the upstream.
    pub latency: LatencyStats,
    pub buffered_events: usize,
    /// Events evicted from the ring buffer.
    pub flushed_events: u64,
}

// ============================================================================
// COLLECTOR
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    short_circuited: u64,
    cache_hits: u64,
    cache_misses: u64,
    retries: u64,
    rate_limited: u64,
    circuit_transitions: u64,
    errors_by_type: HashMap<ErrorType, u64>,
}

#[derive(Debug, Default)]
struct CollectorState {
    events: VecDeque<TelemetryEvent>,
    /// Count per `category.type`, never evicted.
    aggregates: HashMap<String, u64>,
    flushed: u64,
    latencies: VecDeque<Duration>,
    counters: Counters,
}

/// Ring-buffer telemetry collector.
///
/// Events are appended in completion order. Once `capacity` is reached the
/// oldest event is dropped for each new one; the aggregate counts keep
/// covering every event ever recorded.
#[derive(Debug)]
pub struct TelemetryCollector {
    capacity: usize,
    latency_capacity: usize,
    state: Mutex<CollectorState>,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_CAPACITY)
    }
}

impl TelemetryCollector {
    /// Collector holding at most `capacity` events (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            latency_capacity: DEFAULT_LATENCY_SAMPLES,
            state: Mutex::new(CollectorState {
                events: VecDeque::with_capacity(capacity),
                ..CollectorState::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, state: &mut CollectorState, event: TelemetryEvent) {
        *state.aggregates.entry(event.stat_key()).or_insert(0) += 1;
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            state.flushed += 1;
        }
        state.events.push_back(event);
    }

    fn push_latency(&self, state: &mut CollectorState, latency: Duration) {
        if state.latencies.len() >= self.latency_capacity {
            state.latencies.pop_front();
        }
        state.latencies.push_back(latency);
    }

    /// Append a raw event.
    pub fn record(&self, event: TelemetryEvent) {
        let mut state = self.lock();
        self.push(&mut state, event);
    }

    /// A request that completed successfully. Cached answers do not add a
    /// latency sample.
    pub fn record_request_success(
        &self,
        endpoint: &str,
        latency: Duration,
        attempts: u32,
        from_cache: bool,
    ) {
        let event = TelemetryEvent::new(TelemetryCategory::Request, "success")
            .with("endpoint", endpoint)
            .with("latency_ms", latency.as_millis() as u64)
            .with("attempts", attempts)
            .with("cached", from_cache);

        let mut state = self.lock();
        state.counters.total_requests += 1;
        state.counters.successful_requests += 1;
        if !from_cache {
            self.push_latency(&mut state, latency);
        }
        self.push(&mut state, event);
    }

    /// A request that surfaced `error` to its caller.
    ///
    /// Breaker rejections only count toward `short_circuited` and
    /// `errors_by_type`; they never reached the upstream.
    pub fn record_request_failure(
        &self,
        endpoint: &str,
        error: &ApiError,
        latency: Duration,
        attempts: u32,
    ) {
        let mut event = TelemetryEvent::new(TelemetryCategory::Request, "failure")
            .with("endpoint", endpoint)
            .with("error_type", error.error_type.as_str())
            .with("message", error.message.clone())
            .with("latency_ms", latency.as_millis() as u64)
            .with("attempts", attempts);
        if let Some(status) = error.status_code {
            event = event.with("status_code", status);
        }

        let mut state = self.lock();
        *state
            .counters
            .errors_by_type
            .entry(error.error_type)
            .or_insert(0) += 1;
        if error.error_type == ErrorType::CircuitOpen {
            state.counters.short_circuited += 1;
        } else {
            state.counters.total_requests += 1;
            state.counters.failed_requests += 1;
            if attempts > 0 {
                self.push_latency(&mut state, latency);
            }
        }
        self.push(&mut state, event);
    }

    pub fn record_cache_hit(&self, key: &str) {
        let mut state = self.lock();
        state.counters.cache_hits += 1;
        self.push(
            &mut state,
            TelemetryEvent::new(TelemetryCategory::Cache, "hit").with("key", key),
        );
    }

    pub fn record_cache_miss(&self, key: &str) {
        let mut state = self.lock();
        state.counters.cache_misses += 1;
        self.push(
            &mut state,
            TelemetryEvent::new(TelemetryCategory::Cache, "miss").with("key", key),
        );
    }

    /// A retry scheduled after `attempt` failed attempts.
    pub fn record_retry(&self, endpoint: &str, attempt: u32, delay: Duration, error: &ApiError) {
        let event = TelemetryEvent::new(TelemetryCategory::Retry, "scheduled")
            .with("endpoint", endpoint)
            .with("attempt", attempt)
            .with("delay_ms", delay.as_millis() as u64)
            .with("error_type", error.error_type.as_str());
        let mut state = self.lock();
        state.counters.retries += 1;
        self.push(&mut state, event);
    }

    pub fn record_rate_limited(&self, key: &str) {
        let mut state = self.lock();
        state.counters.rate_limited += 1;
        self.push(
            &mut state,
            TelemetryEvent::new(TelemetryCategory::RateLimit, "rejected").with("key", key),
        );
    }

    pub fn record_health(&self, result: &HealthCheckResult) {
        let event_type = if result.healthy { "healthy" } else { "unhealthy" };
        let mut event = TelemetryEvent::new(TelemetryCategory::Health, event_type)
            .with("latency_ms", result.latency.as_millis() as u64)
            .with("message", result.message.clone());
        if let Some(error) = &result.error {
            event = event.with("error", error.clone());
        }
        self.record(event);
    }

    /// All buffered events, oldest first.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// The newest `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<TelemetryEvent> {
        let state = self.lock();
        let skip = state.events.len().saturating_sub(n);
        state.events.iter().skip(skip).cloned().collect()
    }

    pub fn events_by_category(&self, category: TelemetryCategory) -> Vec<TelemetryEvent> {
        self.lock()
            .events
            .iter()
            .filter(|event| event.category == category)
            .cloned()
            .collect()
    }

    /// Lifetime count for a `category.type` key.
    pub fn count(&self, stat_key: &str) -> u64 {
        self.lock().aggregates.get(stat_key).copied().unwrap_or(0)
    }

    /// Lifetime counts per `category.type`, sorted by key.
    pub fn aggregates(&self) -> BTreeMap<String, u64> {
        self.lock()
            .aggregates
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Events evicted so far.
    pub fn flushed(&self) -> u64 {
        self.lock().flushed
    }

    pub fn summary(&self) -> TelemetrySummary {
        let state = self.lock();
        let counters = &state.counters;
        let error_rate = if counters.total_requests == 0 {
            0.0
        } else {
            counters.failed_requests as f64 / counters.total_requests as f64
        };
        TelemetrySummary {
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            error_rate,
            short_circuited: counters.short_circuited,
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            retries: counters.retries,
            rate_limited: counters.rate_limited,
            circuit_transitions: counters.circuit_transitions,
            errors_by_type: counters
                .errors_by_type
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            latency: LatencyStats::from_samples(&state.latencies),
            buffered_events: state.events.len(),
            flushed_events: state.flushed,
        }
    }

    /// Drop every event, sample and counter.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = CollectorState::default();
    }
}

impl CircuitListener for TelemetryCollector {
    fn on_state_change(&self, from: CircuitState, to: CircuitState, stats: &CircuitStats) {
        let event_type = match to {
            CircuitState::Open => "opened",
            CircuitState::HalfOpen => "half_opened",
            CircuitState::Closed => "closed",
        };
        let event = TelemetryEvent::new(TelemetryCategory::CircuitBreaker, event_type)
            .with("from", from.as_str())
            .with("to", to.as_str())
            .with("failure_count", stats.failure_count);

        let mut state = self.lock();
        state.counters.circuit_transitions += 1;
        self.push(&mut state, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let collector = TelemetryCollector::new(3);
        for i in 0..5 {
            collector.record_cache_hit(&format!("post:{}", i));
        }
        assert_eq!(collector.len(), 3);
        assert_eq!(collector.flushed(), 2);
        assert_eq!(collector.count("cache.hit"), 5);

        let keys: Vec<_> = collector
            .events()
            .iter()
            .map(|e| e.data["key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["post:2", "post:3", "post:4"]);
    }

    #[test]
    fn test_recent_and_by_category() {
        let collector = TelemetryCollector::new(10);
        collector.record_cache_miss("a");
        collector.record_rate_limited("__default__");
        collector.record_cache_hit("a");

        let recent = collector.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].category, TelemetryCategory::RateLimit);
        assert_eq!(recent[1].event_type, "hit");
        assert_eq!(collector.recent(50).len(), 3);
        assert_eq!(collector.events_by_category(TelemetryCategory::Cache).len(), 2);
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let collector = TelemetryCollector::new(200);
        for i in 1..=100 {
            collector.record_request_success("posts", ms(i), 1, false);
        }
        collector.record_request_success("posts", ms(10_000), 0, true);

        let latency = collector.summary().latency;
        assert_eq!(latency.samples, 100);
        assert_eq!(latency.p50, ms(50));
        assert_eq!(latency.p95, ms(95));
        assert_eq!(latency.p99, ms(99));
        assert_eq!(latency.avg, Duration::from_micros(50_500));
    }

    #[test]
    fn test_summary_counts() {
        let collector = TelemetryCollector::default();
        collector.record_request_success("posts", ms(20), 1, false);
        collector.record_request_failure("posts", &ApiError::server("boom").with_status(503), ms(30), 2);
        collector.record_request_failure("posts", &ApiError::circuit_open("open"), ms(0), 0);
        collector.record_retry("posts", 1, ms(1_000), &ApiError::server("boom"));

        let summary = collector.summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.failed_requests, 1);
        assert!((summary.error_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.short_circuited, 1);
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.errors_by_type.get("server"), Some(&1));
        assert_eq!(summary.errors_by_type.get("circuit_open"), Some(&1));
        assert_eq!(summary.latency.samples, 2);
        assert_eq!(collector.count("request.failure"), 2);
    }

    #[test]
    fn test_breaker_rejections_stay_out_of_error_rate() {
        let collector = TelemetryCollector::default();
        for _ in 0..3 {
            collector.record_request_failure("posts", &ApiError::server("boom"), ms(30), 1);
        }
        for _ in 0..7 {
            collector.record_request_failure("posts", &ApiError::circuit_open("open"), ms(0), 0);
        }

        let summary = collector.summary();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.failed_requests, 3);
        assert!((summary.error_rate - 1.0).abs() < 1e-9);
        assert_eq!(summary.short_circuited, 7);
        assert_eq!(summary.errors_by_type.get("circuit_open"), Some(&7));
        assert_eq!(summary.errors_by_type.get("server"), Some(&3));
        assert_eq!(summary.latency.samples, 3);
    }

    #[test]
    fn test_circuit_listener_records_transitions() {
        let collector = TelemetryCollector::default();
        let stats = CircuitStats {
            state: CircuitState::Open,
            failure_count: 5,
            success_count: 0,
            last_failure_at: None,
            next_attempt_in: Some(ms(60_000)),
            transitions: 1,
        };
        collector.on_state_change(CircuitState::Closed, CircuitState::Open, &stats);

        assert_eq!(collector.count("circuit_breaker.opened"), 1);
        assert_eq!(collector.summary().circuit_transitions, 1);
        let event = &collector.events()[0];
        assert_eq!(event.data["from"], "CLOSED");
        assert_eq!(event.data["failure_count"], 5);
    }

    #[test]
    fn test_reset() {
        let collector = TelemetryCollector::new(2);
        for _ in 0..4 {
            collector.record_cache_miss("x");
        }
        collector.reset();
        assert!(collector.is_empty());
        assert_eq!(collector.flushed(), 0);
        assert_eq!(collector.count("cache.miss"), 0);
        assert_eq!(collector.summary(), TelemetrySummary::default());
    }
}
