//! Cache entry record.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

/// One cached response.
///
/// Owned exclusively by the cache. `dependents` is a back-reference used
/// only to find what to sweep on invalidation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Monotonic creation time, used for expiry.
    pub created_at: Instant,
    /// Wall-clock creation time, for reporting.
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
    /// Keys this entry's correctness relies on.
    pub dependencies: BTreeSet<String>,
    /// Keys that rely on this entry.
    pub dependents: BTreeSet<String>,
    /// Serialized size of `value`, captured at insertion.
    pub(crate) value_bytes: usize,
}

impl CacheEntry {
    pub(crate) fn new(
        key: String,
        value: Value,
        ttl: Duration,
        dependencies: BTreeSet<String>,
        now: Instant,
    ) -> Self {
        let value_bytes = value.to_string().len();
        Self {
            key,
            value,
            created_at: now,
            cached_at: Utc::now(),
            ttl,
            dependencies,
            dependents: BTreeSet::new(),
            value_bytes,
        }
    }

    /// Expired once strictly more than `ttl` has passed since creation.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    /// Time elapsed since creation.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Read-only view of an entry's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryInfo {
    pub key: String,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
    pub age: Duration,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

impl CacheEntryInfo {
    pub(crate) fn from_entry(entry: &CacheEntry, now: Instant) -> Self {
        Self {
            key: entry.key.clone(),
            cached_at: entry.cached_at,
            ttl: entry.ttl,
            age: entry.age_at(now),
            dependencies: entry.dependencies.iter().cloned().collect(),
            dependents: entry.dependents.iter().cloned().collect(),
        }
    }
}
