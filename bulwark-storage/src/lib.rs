//! Bulwark Storage - in-process response caching.
//!
//! Holds the dependency-aware cache used by the request orchestrator in
//! `bulwark-resilience`. Everything lives in memory; nothing is persisted.

pub mod cache;

// Re-export cache types for orchestrator integration
pub use cache::{
    entity_key, entity_type_of, fingerprint, CacheEfficiency, CacheEntryInfo, CacheStats,
    DependencyCache, DependencyExtractor, NoDependencies, ShapeExtractor,
};
