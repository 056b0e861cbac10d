//! Cache statistics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Coarse efficiency bucket derived from the hit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEfficiency {
    /// Hit rate above 80%.
    High,
    /// Hit rate above 50%.
    Medium,
    Low,
}

impl CacheEfficiency {
    pub fn from_hit_rate(hit_rate: f64) -> Self {
        if hit_rate > 0.8 {
            CacheEfficiency::High
        } else if hit_rate > 0.5 {
            CacheEfficiency::Medium
        } else {
            CacheEfficiency::Low
        }
    }
}

impl fmt::Display for CacheEfficiency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEfficiency::High => write!(f, "high"),
            CacheEfficiency::Medium => write!(f, "medium"),
            CacheEfficiency::Low => write!(f, "low"),
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, expired reads included.
    pub misses: u64,
    /// Number of `set` calls.
    pub sets: u64,
    /// Entries removed by delete, invalidation or expiry.
    pub deletes: u64,
    /// Entries removed only because something they depended on was removed.
    pub cascade_invalidations: u64,
    /// Dependency keys recorded across all `set` calls.
    pub dependency_registrations: u64,
    /// Entries found expired on read or sweep.
    pub expirations: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Back-edges currently in the dependency graph.
    pub edge_count: u64,
    /// Mean configured TTL across live entries.
    pub average_ttl: Duration,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Share of removals caused by cascading (0.0 to 1.0).
    pub fn invalidation_rate(&self) -> f64 {
        if self.deletes == 0 {
            0.0
        } else {
            self.cascade_invalidations as f64 / self.deletes as f64
        }
    }

    pub fn efficiency(&self) -> CacheEfficiency {
        CacheEfficiency::from_hit_rate(self.hit_rate())
    }
}
