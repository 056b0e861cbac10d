//! Circuit breaker for the protected upstream.
//!
//! The breaker never runs a timer. The OPEN to HALF_OPEN transition happens
//! lazily inside [`CircuitBreaker::poll_and_transition`], the admission check
//! the orchestrator performs before every attempt.
//!
//! A HALF_OPEN breaker admits real traffic only after one recovery probe has
//! passed. The first caller to reach HALF_OPEN claims the probe; everyone
//! else is rejected until the claim is settled.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bulwark_core::CircuitBreakerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// STATE
// ============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are short-circuited until the recovery deadline.
    Open,
    /// Trial calls are let through to probe recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric encoding used by the state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitAdmission {
    Closed,
    /// `run_probe` is set for the one caller that claimed the recovery
    /// probe. It must settle the claim through a [`ProbeGuard`].
    HalfOpen { run_probe: bool },
    /// Rejected; another caller's recovery probe has not settled yet.
    Probing,
    /// Rejected; the recovery deadline is `retry_in` away.
    Open { retry_in: Duration },
}

impl CircuitAdmission {
    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            CircuitAdmission::Closed | CircuitAdmission::HalfOpen { .. }
        )
    }
}

/// Recovery probe bookkeeping while HALF_OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeGate {
    /// No probe needed; traffic flows.
    Idle,
    /// The next admission check claims the probe.
    Pending,
    /// A caller holds the probe; others are rejected.
    InFlight,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time left until the recovery deadline. Only set while OPEN.
    pub next_attempt_in: Option<Duration>,
    /// Number of state transitions since construction or the last reset.
    pub transitions: u64,
}

/// Synchronous observer of state transitions.
pub trait CircuitListener: Send + Sync {
    fn on_state_change(&self, from: CircuitState, to: CircuitState, stats: &CircuitStats);
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    /// Only meaningful while OPEN.
    next_attempt_time: Option<Instant>,
    transitions: u64,
    /// Only meaningful while HALF_OPEN.
    probe: ProbeGate,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_time: None,
            transitions: 0,
            probe: ProbeGate::Idle,
        }
    }

    /// HALF_OPEN admission: claim the probe, wait on it, or pass.
    fn half_open_admission(&mut self) -> CircuitAdmission {
        match self.probe {
            ProbeGate::Pending => {
                self.probe = ProbeGate::InFlight;
                CircuitAdmission::HalfOpen { run_probe: true }
            }
            ProbeGate::InFlight => CircuitAdmission::Probing,
            ProbeGate::Idle => CircuitAdmission::HalfOpen { run_probe: false },
        }
    }

    fn snapshot(&self, now: Instant) -> CircuitStats {
        let next_attempt_in = match (self.state, self.next_attempt_time) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(now)),
            _ => None,
        };
        CircuitStats {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_at: self.last_failure_at,
            next_attempt_in,
            transitions: self.transitions,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant, recovery: Duration) -> Transition {
        let from = self.state;
        self.state = to;
        self.transitions += 1;
        self.probe = ProbeGate::Idle;
        match to {
            CircuitState::Open => {
                self.next_attempt_time = Some(now + recovery);
                self.success_count = 0;
            }
            CircuitState::HalfOpen => {
                self.next_attempt_time = None;
                self.success_count = 0;
                self.probe = ProbeGate::Pending;
            }
            CircuitState::Closed => {
                self.next_attempt_time = None;
                self.failure_count = 0;
                self.success_count = 0;
            }
        }
        Transition {
            from,
            to,
            stats: self.snapshot(now),
        }
    }
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
    stats: CircuitStats,
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Circuit breaker for upstream health management.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    /// Held across a state change and its notification so listeners observe
    /// transitions in the order they happened.
    serial: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn CircuitListener>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::named("upstream", config)
    }

    /// Breaker whose log lines carry `name`.
    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            serial: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a listener. Listeners run synchronously on every transition,
    /// after the state lock is released but before the next transition can
    /// start. A listener may read [`stats`](Self::stats) but must not call
    /// back into a mutating method.
    pub fn add_listener(&self, listener: Arc<dyn CircuitListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    // Counters are always left self-consistent, so a poisoned lock is safe
    // to keep using.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        match transition.to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %transition.from,
                failures = transition.stats.failure_count,
                "Circuit opened"
            ),
            _ => info!(
                breaker = %self.name,
                from = %transition.from,
                to = %transition.to,
                "Circuit state changed"
            ),
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_state_change(transition.from, transition.to, &transition.stats);
        }
    }

    /// Current state without any side effect.
    ///
    /// An OPEN breaker whose deadline has passed still reports OPEN here;
    /// only [`poll_and_transition`](Self::poll_and_transition) moves it.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        self.lock().snapshot(Instant::now())
    }

    /// Admission check. Mutates state.
    ///
    /// If the breaker is OPEN and the recovery deadline has passed, this call
    /// performs the OPEN to HALF_OPEN transition. While HALF_OPEN, the first
    /// caller gets `HalfOpen { run_probe: true }` and owns the recovery probe;
    /// callers arriving before it settles get [`CircuitAdmission::Probing`].
    pub fn poll_and_transition(&self) -> CircuitAdmission {
        let _serial = self.serialize();
        let now = Instant::now();
        let mut transition = None;

        let admission = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => CircuitAdmission::Closed,
                CircuitState::HalfOpen => state.half_open_admission(),
                CircuitState::Open => match state.next_attempt_time {
                    Some(at) if now < at => CircuitAdmission::Open {
                        retry_in: at - now,
                    },
                    _ => {
                        transition = Some(state.transition(
                            CircuitState::HalfOpen,
                            now,
                            self.config.recovery_timeout(),
                        ));
                        state.half_open_admission()
                    }
                },
            }
        };

        self.notify(transition);
        admission
    }

    /// Whether calls are currently rejected.
    ///
    /// Same side effect as [`poll_and_transition`](Self::poll_and_transition),
    /// including claiming a pending recovery probe.
    pub fn is_open(&self) -> bool {
        !self.poll_and_transition().is_allowed()
    }

    /// Settle a claimed probe as healthy: HALF_OPEN traffic may flow.
    pub fn probe_passed(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && state.probe == ProbeGate::InFlight {
            state.probe = ProbeGate::Idle;
            debug!(breaker = %self.name, "Recovery probe passed");
        }
    }

    /// Release a claimed probe without a verdict; the next admission check
    /// claims it again.
    pub fn probe_abandoned(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && state.probe == ProbeGate::InFlight {
            state.probe = ProbeGate::Pending;
            debug!(breaker = %self.name, "Recovery probe abandoned");
        }
    }

    /// Guard for a claimed probe. Dropping it unsettled abandons the probe.
    pub fn probe_guard(&self) -> ProbeGuard<'_> {
        ProbeGuard {
            breaker: self,
            settled: false,
        }
    }

    /// Report a successful attempt.
    ///
    /// In CLOSED the failure count decays by one instead of resetting.
    pub fn record_success(&self) {
        let _serial = self.serialize();
        let now = Instant::now();
        let transition = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => {
                    state.failure_count = state.failure_count.saturating_sub(1);
                    None
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        Some(state.transition(
                            CircuitState::Closed,
                            now,
                            self.config.recovery_timeout(),
                        ))
                    } else {
                        None
                    }
                }
                CircuitState::Open => {
                    debug!(breaker = %self.name, "Ignoring success reported while open");
                    None
                }
            }
        };
        self.notify(transition);
    }

    /// Report a failed attempt that counts against upstream health.
    pub fn record_failure(&self) {
        let _serial = self.serialize();
        let now = Instant::now();
        let transition = {
            let mut state = self.lock();
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_at = Some(Utc::now());
            match state.state {
                CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                    Some(state.transition(
                        CircuitState::Open,
                        now,
                        self.config.recovery_timeout(),
                    ))
                }
                CircuitState::HalfOpen => Some(state.transition(
                    CircuitState::Open,
                    now,
                    self.config.recovery_timeout(),
                )),
                _ => None,
            }
        };
        self.notify(transition);
    }

    /// Return to CLOSED with all counters cleared.
    pub fn reset(&self) {
        let _serial = self.serialize();
        let transition = {
            let mut state = self.lock();
            let from = state.state;
            *state = BreakerState::new();
            (from != CircuitState::Closed).then(|| Transition {
                from,
                to: CircuitState::Closed,
                stats: state.snapshot(Instant::now()),
            })
        };
        info!(breaker = %self.name, "Circuit reset");
        self.notify(transition);
    }
}

/// A claimed recovery probe.
///
/// Settle it with [`pass`](Self::pass) or [`fail`](Self::fail). Dropping it
/// unsettled (the probing caller was cancelled, or its probe never ran)
/// hands the probe to the next caller.
pub struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl ProbeGuard<'_> {
    /// The probe succeeded; admit HALF_OPEN traffic.
    pub fn pass(mut self) {
        self.settled = true;
        self.breaker.probe_passed();
    }

    /// The probe failed; back to OPEN with a fresh recovery deadline.
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.probe_abandoned();
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &state.state)
            .field("failure_count", &state.failure_count)
            .field("success_count", &state.success_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, recovery_ms: u64, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout_ms: recovery_ms,
            success_threshold,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(CircuitState, CircuitState)>>,
    }

    impl CircuitListener for Recorder {
        fn on_state_change(&self, from: CircuitState, to: CircuitState, _stats: &CircuitStats) {
            self.seen.lock().unwrap().push((from, to));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_recovery_cycle() {
        let breaker = CircuitBreaker::new(config(3, 1_000, 2));
        let recorder = Arc::new(Recorder::default());
        breaker.add_listener(recorder.clone());

        for _ in 0..3 {
            assert!(!breaker.is_open());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(matches!(
            breaker.poll_and_transition(),
            CircuitAdmission::Open { .. }
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(
            breaker.poll_and_transition(),
            CircuitAdmission::HalfOpen { run_probe: true }
        );
        assert_eq!(breaker.poll_and_transition(), CircuitAdmission::Probing);
        breaker.probe_passed();
        assert_eq!(
            breaker.poll_and_transition(),
            CircuitAdmission::HalfOpen { run_probe: false }
        );

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_rearms() {
        let breaker = CircuitBreaker::new(config(1, 500, 2));
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        let stats = breaker.stats();
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.next_attempt_in, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_closed_success_decays_failure_count() {
        let breaker = CircuitBreaker::new(config(5, 1_000, 2));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.stats().failure_count, 2);

        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.stats().failure_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_while_open_do_not_retransition() {
        let breaker = CircuitBreaker::new(config(2, 60_000, 1));
        for _ in 0..6 {
            breaker.record_failure();
        }
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.transitions, 1);
        assert_eq!(stats.failure_count, 6);
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::new(config(1, 60_000, 1));
        let recorder = Arc::new(Recorder::default());
        breaker.add_listener(recorder.clone());
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.is_open());
        assert_eq!(breaker.stats().transitions, 0);
        assert_eq!(
            recorder.seen.lock().unwrap().last(),
            Some(&(CircuitState::Open, CircuitState::Closed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_guard_hands_probe_to_next_caller() {
        let breaker = CircuitBreaker::new(config(1, 100, 1));
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        assert_eq!(
            breaker.poll_and_transition(),
            CircuitAdmission::HalfOpen { run_probe: true }
        );
        drop(breaker.probe_guard());
        assert_eq!(
            breaker.poll_and_transition(),
            CircuitAdmission::HalfOpen { run_probe: true }
        );
        breaker.probe_guard().fail();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.poll_and_transition(),
            CircuitAdmission::Open { .. }
        ));
    }

    #[test]
    fn test_probe_settlement_outside_half_open_is_ignored() {
        let breaker = CircuitBreaker::new(config(1, 60_000, 1));
        breaker.probe_passed();
        breaker.probe_abandoned();
        assert_eq!(breaker.poll_and_transition(), CircuitAdmission::Closed);
    }

    /// Remembers only the newest target state, like a gauge does.
    #[derive(Default)]
    struct LastState(Mutex<Option<CircuitState>>);

    impl CircuitListener for LastState {
        fn on_state_change(&self, _from: CircuitState, to: CircuitState, _stats: &CircuitStats) {
            *self.0.lock().unwrap() = Some(to);
        }
    }

    #[test]
    fn test_concurrent_transitions_notify_in_order() {
        let breaker = CircuitBreaker::new(config(1, 0, 1));
        let last = Arc::new(LastState::default());
        breaker.add_listener(last.clone());

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let breaker = &breaker;
                scope.spawn(move || {
                    for i in 0..500 {
                        match (worker + i) % 3 {
                            0 => breaker.record_failure(),
                            1 => {
                                if breaker.poll_and_transition()
                                    == (CircuitAdmission::HalfOpen { run_probe: true })
                                {
                                    breaker.probe_guard().pass();
                                }
                            }
                            _ => breaker.record_success(),
                        }
                    }
                });
            }
        });

        assert!(breaker.stats().transitions > 0);
        assert_eq!(*last.0.lock().unwrap(), Some(breaker.state()));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
