//! Configuration types
//!
//! Every section deserializes from TOML with defaults for missing fields,
//! and can be overridden from `BULWARK_*` environment variables.

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            recovery_timeout_ms: DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_MS,
            success_threshold: DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    /// Disable retries entirely (test and diagnostic environments).
    pub skip_retries: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_enabled: true,
            skip_retries: false,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ============================================================================
// RATE LIMITING
// ============================================================================

/// A single sliding-window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limiter configuration: a default budget plus per-key overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    /// Budgets for specific protected resources or callers.
    pub per_key: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            per_key: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// The default rule.
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.max_requests, self.window_ms)
    }

    /// The rule governing `key`.
    pub fn rule_for(&self, key: &str) -> RateLimitRule {
        self.per_key
            .get(key)
            .copied()
            .unwrap_or_else(|| self.default_rule())
    }

    /// Add a per-key override.
    pub fn with_rule(mut self, key: impl Into<String>, rule: RateLimitRule) -> Self {
        self.per_key.insert(key.into(), rule);
        self
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Freshness class of a cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    /// Volatile data: search results, previews.
    Short,
    /// Lists and single items.
    #[default]
    Medium,
    /// Near-static taxonomy and media.
    Long,
}

/// TTL per entity class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheTtlConfig {
    pub short_ttl_ms: u64,
    pub medium_ttl_ms: u64,
    pub long_ttl_ms: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            short_ttl_ms: DEFAULT_SHORT_TTL_MS,
            medium_ttl_ms: DEFAULT_MEDIUM_TTL_MS,
            long_ttl_ms: DEFAULT_LONG_TTL_MS,
        }
    }
}

impl CacheTtlConfig {
    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        let ms = match class {
            TtlClass::Short => self.short_ttl_ms,
            TtlClass::Medium => self.medium_ttl_ms,
            TtlClass::Long => self.long_ttl_ms,
        };
        Duration::from_millis(ms)
    }
}

// ============================================================================
// HEALTH
// ============================================================================

/// Health probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            max_attempts: DEFAULT_HEALTH_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_HEALTH_RETRY_DELAY_MS,
        }
    }
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Complete configuration of one protected upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheTtlConfig,
    pub health: HealthCheckConfig,
    pub request_timeout_ms: u64,
    pub telemetry_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheTtlConfig::default(),
            health: HealthCheckConfig::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
        }
    }
}

impl ResilienceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Defaults overridden by `BULWARK_*` environment variables.
    ///
    /// # Environment Variables
    /// - `BULWARK_CIRCUIT_FAILURE_THRESHOLD` (default: 5)
    /// - `BULWARK_CIRCUIT_RECOVERY_TIMEOUT_MS` (default: 60000)
    /// - `BULWARK_CIRCUIT_SUCCESS_THRESHOLD` (default: 2)
    /// - `BULWARK_RETRY_MAX_RETRIES` (default: 3)
    /// - `BULWARK_RETRY_INITIAL_DELAY_MS` (default: 1000)
    /// - `BULWARK_RETRY_MAX_DELAY_MS` (default: 30000)
    /// - `BULWARK_RETRY_BACKOFF_MULTIPLIER` (default: 2)
    /// - `BULWARK_RETRY_JITTER`: "true" or "false" (default: true)
    /// - `BULWARK_SKIP_RETRIES`: "true" or "false" (default: false)
    /// - `BULWARK_RATE_LIMIT_MAX_REQUESTS` (default: 100)
    /// - `BULWARK_RATE_LIMIT_WINDOW_MS` (default: 60000)
    /// - `BULWARK_CACHE_SHORT_TTL_MS`, `BULWARK_CACHE_MEDIUM_TTL_MS`, `BULWARK_CACHE_LONG_TTL_MS`
    /// - `BULWARK_HEALTH_TIMEOUT_MS` (default: 5000)
    /// - `BULWARK_REQUEST_TIMEOUT_MS` (default: 30000)
    /// - `BULWARK_TELEMETRY_CAPACITY` (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from a variable lookup. Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let cb = &mut self.circuit_breaker;
        override_with(&lookup, "BULWARK_CIRCUIT_FAILURE_THRESHOLD", &mut cb.failure_threshold);
        override_with(&lookup, "BULWARK_CIRCUIT_RECOVERY_TIMEOUT_MS", &mut cb.recovery_timeout_ms);
        override_with(&lookup, "BULWARK_CIRCUIT_SUCCESS_THRESHOLD", &mut cb.success_threshold);

        let retry = &mut self.retry;
        override_with(&lookup, "BULWARK_RETRY_MAX_RETRIES", &mut retry.max_retries);
        override_with(&lookup, "BULWARK_RETRY_INITIAL_DELAY_MS", &mut retry.initial_delay_ms);
        override_with(&lookup, "BULWARK_RETRY_MAX_DELAY_MS", &mut retry.max_delay_ms);
        override_with(&lookup, "BULWARK_RETRY_BACKOFF_MULTIPLIER", &mut retry.backoff_multiplier);
        override_flag(&lookup, "BULWARK_RETRY_JITTER", &mut retry.jitter_enabled);
        override_flag(&lookup, "BULWARK_SKIP_RETRIES", &mut retry.skip_retries);

        let limit = &mut self.rate_limit;
        override_with(&lookup, "BULWARK_RATE_LIMIT_MAX_REQUESTS", &mut limit.max_requests);
        override_with(&lookup, "BULWARK_RATE_LIMIT_WINDOW_MS", &mut limit.window_ms);

        let cache = &mut self.cache;
        override_with(&lookup, "BULWARK_CACHE_SHORT_TTL_MS", &mut cache.short_ttl_ms);
        override_with(&lookup, "BULWARK_CACHE_MEDIUM_TTL_MS", &mut cache.medium_ttl_ms);
        override_with(&lookup, "BULWARK_CACHE_LONG_TTL_MS", &mut cache.long_ttl_ms);

        override_with(&lookup, "BULWARK_HEALTH_TIMEOUT_MS", &mut self.health.timeout_ms);
        override_with(&lookup, "BULWARK_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_with(&lookup, "BULWARK_TELEMETRY_CAPACITY", &mut self.telemetry_capacity);
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cb = &self.circuit_breaker;
        require_positive("circuit_breaker.failure_threshold", cb.failure_threshold as u64)?;
        require_positive("circuit_breaker.success_threshold", cb.success_threshold as u64)?;
        require_positive("circuit_breaker.recovery_timeout_ms", cb.recovery_timeout_ms)?;

        let retry = &self.retry;
        require_positive("retry.max_delay_ms", retry.max_delay_ms)?;
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                retry.max_delay_ms,
                "must be >= retry.initial_delay_ms",
            ));
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                retry.backoff_multiplier,
                "must be a finite number >= 1.0",
            ));
        }

        require_positive("rate_limit.max_requests", self.rate_limit.max_requests as u64)?;
        require_positive("rate_limit.window_ms", self.rate_limit.window_ms)?;
        for (key, rule) in &self.rate_limit.per_key {
            require_positive(&format!("rate_limit.per_key.{}.max_requests", key), rule.max_requests as u64)?;
            require_positive(&format!("rate_limit.per_key.{}.window_ms", key), rule.window_ms)?;
        }

        require_positive("cache.short_ttl_ms", self.cache.short_ttl_ms)?;
        require_positive("cache.medium_ttl_ms", self.cache.medium_ttl_ms)?;
        require_positive("cache.long_ttl_ms", self.cache.long_ttl_ms)?;

        require_positive("health.timeout_ms", self.health.timeout_ms)?;
        require_positive("health.max_attempts", self.health.max_attempts as u64)?;
        require_positive("request_timeout_ms", self.request_timeout_ms)?;
        require_positive("telemetry_capacity", self.telemetry_capacity as u64)?;
        Ok(())
    }
}

fn override_with<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key).and_then(|s| s.trim().parse().ok()) {
        *target = value;
    }
}

fn override_flag<F>(lookup: &F, key: &str, target: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            _ => {}
        }
    }
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, value, "must be > 0"));
    }
    Ok(())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
