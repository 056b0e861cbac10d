//! Default values for the request core.
//!
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive failures that open the circuit.
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// How long the circuit stays open before a recovery attempt (ms).
pub const DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_MS: u64 = 60_000;

/// Successes in half-open needed to close the circuit.
pub const DEFAULT_CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;

// ============================================================================
// RETRY
// ============================================================================

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Lower bound of the multiplicative jitter factor.
pub const JITTER_MIN_FACTOR: f64 = 0.5;

/// Upper bound (exclusive) of the multiplicative jitter factor.
pub const JITTER_MAX_FACTOR: f64 = 1.5;

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Requests admitted per window for the default key.
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 100;

pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// Window key used for calls that carry no caller key.
pub const DEFAULT_RATE_LIMIT_KEY: &str = "__default__";

// ============================================================================
// CACHE
// ============================================================================

/// Volatile data such as search results (2 minutes).
pub const DEFAULT_SHORT_TTL_MS: u64 = 120_000;

/// Lists and single items (5 minutes).
pub const DEFAULT_MEDIUM_TTL_MS: u64 = 300_000;

/// Near-static taxonomy and media (30 minutes).
pub const DEFAULT_LONG_TTL_MS: u64 = 1_800_000;

/// Fixed bookkeeping estimate per cache entry, in bytes.
pub const CACHE_ENTRY_OVERHEAD_BYTES: usize = 64;

/// Fixed bookkeeping estimate per dependency edge, in bytes.
pub const CACHE_EDGE_OVERHEAD_BYTES: usize = 16;

// ============================================================================
// HEALTH / REQUESTS / TELEMETRY
// ============================================================================

pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_HEALTH_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_HEALTH_RETRY_DELAY_MS: u64 = 1_000;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Ring buffer capacity of the telemetry collector.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1_000;

/// Latency samples retained for percentile computation.
pub const DEFAULT_LATENCY_SAMPLES: usize = 1_000;
