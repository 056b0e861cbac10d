//! Dependency-aware response cache.
//!
//! Entries form a dependency graph: when entry `A` is stored with `B` in its
//! dependencies and `B` is already cached, `A` is added to `B`'s dependents.
//! Invalidating `B` then sweeps `A` and everything that transitively
//! depends on it. All graph mutations happen under one write lock, so no
//! reader ever sees an edge with only one side written.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bulwark_core::constants::{CACHE_EDGE_OVERHEAD_BYTES, CACHE_ENTRY_OVERHEAD_BYTES};
use bulwark_core::{BulwarkError, BulwarkResult, StorageError};
use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, CacheEntryInfo};
use super::key::entity_type_of;
use super::traits::CacheStats;

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    cascade_invalidations: u64,
    dependency_registrations: u64,
    expirations: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    counters: Counters,
}

impl CacheState {
    /// Remove `key` from the dependents of everything it depends on.
    fn detach_forward_edges(&mut self, key: &str, dependencies: &BTreeSet<String>) {
        for dep in dependencies {
            if let Some(entry) = self.entries.get_mut(dep) {
                entry.dependents.remove(key);
            }
        }
    }

    /// Remove `root` and the transitive closure of its dependents.
    ///
    /// Depth-first over an explicit stack with a visited set, so a cyclic
    /// graph terminates. Returns the number of entries removed.
    fn invalidate_from(&mut self, root: &str) -> usize {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![root.to_string()];
        let mut removed = 0;

        while let Some(key) = stack.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            self.detach_forward_edges(&key, &entry.dependencies);

            removed += 1;
            self.counters.deletes += 1;
            if key != root {
                self.counters.cascade_invalidations += 1;
            }

            // Reverse so the first dependent is visited first.
            for dependent in entry.dependents.into_iter().rev() {
                if !visited.contains(&dependent) {
                    stack.push(dependent);
                }
            }
        }

        if removed > 1 {
            debug!(key = %root, removed, "Cascading invalidation");
        }
        removed
    }
}

/// In-process response cache with TTL and cascading invalidation.
#[derive(Debug, Default)]
pub struct DependencyCache {
    state: RwLock<CacheState>,
}

impl DependencyCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> BulwarkResult<RwLockReadGuard<'_, CacheState>> {
        self.state
            .read()
            .map_err(|_| BulwarkError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> BulwarkResult<RwLockWriteGuard<'_, CacheState>> {
        self.state
            .write()
            .map_err(|_| BulwarkError::Storage(StorageError::LockPoisoned))
    }

    /// Look up a value.
    ///
    /// An expired entry is a miss and is removed through the cascading
    /// path, so its dependents go with it.
    pub fn get(&self, key: &str) -> BulwarkResult<Option<Value>> {
        let now = Instant::now();
        let mut state = self.write()?;

        match state.entries.get(key) {
            None => {
                state.counters.misses += 1;
                debug!(key, "Cache miss");
                return Ok(None);
            }
            Some(entry) if !entry.is_expired_at(now) => {
                let value = entry.value.clone();
                state.counters.hits += 1;
                debug!(key, "Cache hit");
                return Ok(Some(value));
            }
            Some(_) => {}
        }

        state.counters.misses += 1;
        state.counters.expirations += 1;
        state.invalidate_from(key);
        debug!(key, "Cache entry expired");
        Ok(None)
    }

    /// Store a value.
    ///
    /// Every dependency key is recorded on the new entry. Dependencies that
    /// are currently cached also get a back-edge to `key`; absent ones get
    /// none. Overwriting an existing key keeps its live dependents.
    pub fn set<I, S>(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Duration,
        dependencies: I,
    ) -> BulwarkResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let dependencies: BTreeSet<String> = dependencies
            .into_iter()
            .map(Into::into)
            .filter(|dep: &String| *dep != key)
            .collect();
        let now = Instant::now();

        let mut state = self.write()?;
        state.counters.sets += 1;
        state.counters.dependency_registrations += dependencies.len() as u64;

        let carried = match state.entries.remove(&key) {
            Some(old) => {
                state.detach_forward_edges(&key, &old.dependencies);
                old.dependents
                    .into_iter()
                    .filter(|dependent| {
                        state
                            .entries
                            .get(dependent)
                            .is_some_and(|e| e.dependencies.contains(&key))
                    })
                    .collect()
            }
            None => BTreeSet::new(),
        };

        for dep in &dependencies {
            if let Some(entry) = state.entries.get_mut(dep) {
                entry.dependents.insert(key.clone());
            }
        }

        let mut entry = CacheEntry::new(key.clone(), value, ttl, dependencies, now);
        entry.dependents = carried;
        state.entries.insert(key, entry);
        Ok(())
    }

    /// Remove `key` and, transitively, everything that depends on it.
    ///
    /// Returns the number of entries removed. The sweep is complete when
    /// this returns.
    pub fn invalidate(&self, key: &str) -> BulwarkResult<usize> {
        let mut state = self.write()?;
        Ok(state.invalidate_from(key))
    }

    /// Remove `key` only. Dependents keep their now dangling reference to it;
    /// see [`cleanup_orphan_dependencies`](Self::cleanup_orphan_dependencies).
    pub fn delete(&self, key: &str) -> BulwarkResult<bool> {
        let mut state = self.write()?;
        let Some(entry) = state.entries.remove(key) else {
            return Ok(false);
        };
        state.detach_forward_edges(key, &entry.dependencies);
        state.counters.deletes += 1;
        Ok(true)
    }

    /// Invalidate (cascading) every key matching `pattern`.
    pub fn clear_pattern(&self, pattern: &Regex) -> BulwarkResult<usize> {
        let mut state = self.write()?;
        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        let removed: usize = matching
            .iter()
            .map(|key| state.invalidate_from(key))
            .sum();
        debug!(pattern = %pattern, removed, "Cleared cache pattern");
        Ok(removed)
    }

    /// [`clear_pattern`](Self::clear_pattern) from a regex source string.
    pub fn clear_pattern_str(&self, pattern: &str) -> BulwarkResult<usize> {
        let regex = Regex::new(pattern).map_err(|e| StorageError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.clear_pattern(&regex)
    }

    /// Invalidate (cascading) every key tagged with `entity_type`.
    pub fn invalidate_by_entity_type(&self, entity_type: &str) -> BulwarkResult<usize> {
        let mut state = self.write()?;
        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|key| entity_type_of(key) == Some(entity_type))
            .cloned()
            .collect();
        Ok(matching
            .iter()
            .map(|key| state.invalidate_from(key))
            .sum())
    }

    /// Sweep all expired entries through the cascading path.
    pub fn purge_expired(&self) -> BulwarkResult<usize> {
        let now = Instant::now();
        let mut state = self.write()?;
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();

        let mut removed = 0;
        for key in &expired {
            if state.entries.contains_key(key) {
                state.counters.expirations += 1;
                removed += state.invalidate_from(key);
            }
        }
        Ok(removed)
    }

    /// Drop dependency references to keys that are no longer cached, and
    /// dependent references that no longer point back.
    ///
    /// Returns the number of references removed.
    pub fn cleanup_orphan_dependencies(&self) -> BulwarkResult<usize> {
        let mut state = self.write()?;
        let forward: HashMap<String, BTreeSet<String>> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.dependencies.clone()))
            .collect();

        let mut removed = 0;
        for (key, entry) in state.entries.iter_mut() {
            let before = entry.dependencies.len() + entry.dependents.len();
            entry.dependencies.retain(|dep| forward.contains_key(dep));
            entry.dependents.retain(|dependent| {
                forward
                    .get(dependent)
                    .is_some_and(|deps| deps.contains(key))
            });
            removed += before - (entry.dependencies.len() + entry.dependents.len());
        }

        if removed > 0 {
            debug!(removed, "Removed orphan dependency references");
        }
        Ok(removed)
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) -> BulwarkResult<()> {
        self.write()?.entries.clear();
        Ok(())
    }

    /// Zero the counters.
    pub fn reset_stats(&self) -> BulwarkResult<()> {
        self.write()?.counters = Counters::default();
        Ok(())
    }

    /// Whether a live (unexpired) entry exists. Does not touch counters.
    pub fn contains(&self, key: &str) -> BulwarkResult<bool> {
        let now = Instant::now();
        Ok(self
            .read()?
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now)))
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub fn len(&self) -> BulwarkResult<usize> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> BulwarkResult<bool> {
        Ok(self.read()?.entries.is_empty())
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> BulwarkResult<Vec<String>> {
        let mut keys: Vec<String> = self.read()?.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Metadata of one entry.
    pub fn entry_info(&self, key: &str) -> BulwarkResult<Option<CacheEntryInfo>> {
        let now = Instant::now();
        Ok(self
            .read()?
            .entries
            .get(key)
            .map(|entry| CacheEntryInfo::from_entry(entry, now)))
    }

    /// Recorded dependencies of `key`, sorted.
    pub fn dependencies_of(&self, key: &str) -> BulwarkResult<Vec<String>> {
        Ok(self
            .read()?
            .entries
            .get(key)
            .map(|entry| entry.dependencies.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Keys currently back-linked as depending on `key`, sorted.
    pub fn dependents_of(&self, key: &str) -> BulwarkResult<Vec<String>> {
        Ok(self
            .read()?
            .entries
            .get(key)
            .map(|entry| entry.dependents.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Counters plus metrics derived from the live entries.
    pub fn stats(&self) -> BulwarkResult<CacheStats> {
        let state = self.read()?;
        let counters = &state.counters;

        let entry_count = state.entries.len();
        let mut edge_count = 0usize;
        let mut memory = 0usize;
        let mut ttl_total = Duration::ZERO;

        for (key, entry) in &state.entries {
            edge_count += entry.dependents.len();
            ttl_total += entry.ttl;
            memory += key.len() + entry.value_bytes + CACHE_ENTRY_OVERHEAD_BYTES;
            memory += entry
                .dependencies
                .iter()
                .chain(entry.dependents.iter())
                .map(|edge| edge.len() + CACHE_EDGE_OVERHEAD_BYTES)
                .sum::<usize>();
        }

        let average_ttl = if entry_count == 0 {
            Duration::ZERO
        } else {
            ttl_total / entry_count as u32
        };

        Ok(CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            sets: counters.sets,
            deletes: counters.deletes,
            cascade_invalidations: counters.cascade_invalidations,
            dependency_registrations: counters.dependency_registrations,
            expirations: counters.expirations,
            entry_count: entry_count as u64,
            edge_count: edge_count as u64,
            average_ttl,
            memory_bytes: memory as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::CacheEfficiency;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(5);
    const NO_DEPS: [&str; 0] = [];

    #[test]
    fn test_set_get_roundtrip_counts() {
        let cache = DependencyCache::new();
        cache.set("post:1", json!({"title": "Hello"}), TTL, NO_DEPS).unwrap();

        assert_eq!(cache.get("post:1").unwrap(), Some(json!({"title": "Hello"})));
        assert_eq!(cache.get("post:2").unwrap(), None);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_back_edge_requires_existing_dependency() {
        let cache = DependencyCache::new();
        cache.set("post:1", json!(1), TTL, ["category:5"]).unwrap();
        cache.set("category:5", json!("news"), TTL, NO_DEPS).unwrap();

        // Registered before the dependency existed: no back-edge.
        assert_eq!(cache.dependencies_of("post:1").unwrap(), vec!["category:5"]);
        assert!(cache.dependents_of("category:5").unwrap().is_empty());
        assert_eq!(cache.invalidate("category:5").unwrap(), 1);
        assert!(cache.contains("post:1").unwrap());
    }

    #[test]
    fn test_invalidate_cascades_when_dependency_existed() {
        let cache = DependencyCache::new();
        cache.set("category:5", json!("news"), TTL, NO_DEPS).unwrap();
        cache.set("post:1", json!(1), TTL, ["category:5"]).unwrap();

        assert_eq!(cache.dependents_of("category:5").unwrap(), vec!["post:1"]);
        assert_eq!(cache.invalidate("category:5").unwrap(), 2);
        assert_eq!(cache.get("post:1").unwrap(), None);
        assert_eq!(cache.get("category:5").unwrap(), None);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.deletes, 2);
        assert_eq!(stats.cascade_invalidations, 1);
        assert!((stats.invalidation_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_transitive_closure_and_bystanders() {
        let cache = DependencyCache::new();
        cache.set("site:1", json!(0), TTL, NO_DEPS).unwrap();
        cache.set("category:5", json!(1), TTL, ["site:1"]).unwrap();
        cache.set("post:1", json!(2), TTL, ["category:5"]).unwrap();
        cache.set("posts:list", json!(3), TTL, ["post:1"]).unwrap();
        cache.set("tag:9", json!(4), TTL, NO_DEPS).unwrap();

        assert_eq!(cache.invalidate("site:1").unwrap(), 4);
        assert_eq!(cache.keys().unwrap(), vec!["tag:9"]);
    }

    #[test]
    fn test_cycle_terminates() {
        let cache = DependencyCache::new();
        cache.set("a:1", json!(1), TTL, NO_DEPS).unwrap();
        cache.set("b:1", json!(2), TTL, ["a:1"]).unwrap();
        // Overwrite a:1 to depend on b:1, closing the loop a -> b -> a.
        cache.set("a:1", json!(3), TTL, ["b:1"]).unwrap();
        assert_eq!(cache.dependents_of("a:1").unwrap(), vec!["b:1"]);
        assert_eq!(cache.dependents_of("b:1").unwrap(), vec!["a:1"]);

        assert_eq!(cache.invalidate("a:1").unwrap(), 2);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_self_dependency_is_ignored() {
        let cache = DependencyCache::new();
        cache.set("post:1", json!(1), TTL, ["post:1", "user:2"]).unwrap();
        assert_eq!(cache.dependencies_of("post:1").unwrap(), vec!["user:2"]);
    }

    #[test]
    fn test_overwrite_detaches_old_edges_and_keeps_dependents() {
        let cache = DependencyCache::new();
        cache.set("user:2", json!("ann"), TTL, NO_DEPS).unwrap();
        cache.set("post:1", json!(1), TTL, ["user:2"]).unwrap();
        cache.set("posts:list", json!([1]), TTL, ["post:1"]).unwrap();

        cache.set("post:1", json!(2), TTL, NO_DEPS).unwrap();

        assert!(cache.dependents_of("user:2").unwrap().is_empty());
        assert_eq!(cache.dependents_of("post:1").unwrap(), vec!["posts:list"]);
        assert_eq!(cache.invalidate("post:1").unwrap(), 2);
    }

    #[test]
    fn test_delete_does_not_cascade_and_leaves_dangling_reference() {
        let cache = DependencyCache::new();
        cache.set("category:5", json!(1), TTL, NO_DEPS).unwrap();
        cache.set("post:1", json!(2), TTL, ["category:5"]).unwrap();

        assert!(cache.delete("category:5").unwrap());
        assert!(!cache.delete("category:5").unwrap());
        assert!(cache.contains("post:1").unwrap());
        assert_eq!(cache.dependencies_of("post:1").unwrap(), vec!["category:5"]);

        assert_eq!(cache.cleanup_orphan_dependencies().unwrap(), 1);
        assert!(cache.dependencies_of("post:1").unwrap().is_empty());
        assert_eq!(cache.cleanup_orphan_dependencies().unwrap(), 0);
    }

    #[test]
    fn test_clear_pattern_cascades() {
        let cache = DependencyCache::new();
        cache.set("search:a", json!(1), TTL, NO_DEPS).unwrap();
        cache.set("search:b", json!(2), TTL, NO_DEPS).unwrap();
        cache.set("widget:1", json!(3), TTL, ["search:a"]).unwrap();
        cache.set("post:1", json!(4), TTL, NO_DEPS).unwrap();

        assert_eq!(cache.clear_pattern_str("^search:").unwrap(), 3);
        assert_eq!(cache.keys().unwrap(), vec!["post:1"]);
    }

    #[test]
    fn test_clear_pattern_rejects_bad_regex() {
        let cache = DependencyCache::new();
        let err = cache.clear_pattern_str("(unclosed").unwrap_err();
        assert!(matches!(
            err,
            BulwarkError::Storage(StorageError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_invalidate_by_entity_type() {
        let cache = DependencyCache::new();
        cache.set("post:1", json!(1), TTL, NO_DEPS).unwrap();
        cache.set("post:2", json!(2), TTL, NO_DEPS).unwrap();
        cache.set("postscript:1", json!(3), TTL, NO_DEPS).unwrap();
        cache.set("home:feed", json!(4), TTL, ["post:2"]).unwrap();

        assert_eq!(cache.invalidate_by_entity_type("post").unwrap(), 3);
        assert_eq!(cache.keys().unwrap(), vec!["postscript:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_get_is_miss_and_cascades() {
        let cache = DependencyCache::new();
        cache.set("category:5", json!(1), Duration::from_millis(100), NO_DEPS).unwrap();
        cache.set("post:1", json!(2), Duration::from_secs(60), ["category:5"]).unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.get("category:5").unwrap().is_some(), "ttl boundary is inclusive");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("category:5").unwrap(), None);
        assert!(!cache.contains("post:1").unwrap());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.cascade_invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = DependencyCache::new();
        cache.set("search:a", json!(1), Duration::from_millis(10), NO_DEPS).unwrap();
        cache.set("page:1", json!(2), Duration::from_secs(10), ["search:a"]).unwrap();
        cache.set("tag:1", json!(3), Duration::from_secs(10), NO_DEPS).unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(cache.purge_expired().unwrap(), 2);
        assert_eq!(cache.keys().unwrap(), vec!["tag:1"]);
    }

    #[test]
    fn test_stats_derived_metrics() {
        let cache = DependencyCache::new();
        cache.set("category:5", json!("ab"), Duration::from_secs(2), NO_DEPS).unwrap();
        cache.set("post:1", json!(1), Duration::from_secs(4), ["category:5"]).unwrap();

        for _ in 0..9 {
            cache.get("post:1").unwrap();
        }
        cache.get("missing").unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.average_ttl, Duration::from_secs(3));
        assert_eq!(stats.edge_count, 1);
        assert_eq!(stats.dependency_registrations, 1);
        assert_eq!(stats.efficiency(), CacheEfficiency::High);

        // "category:5" + "\"ab\"" + overhead + back-edge "post:1"
        // "post:1" + "1" + overhead + forward edge "category:5"
        let expected = (10 + 4 + CACHE_ENTRY_OVERHEAD_BYTES + 6 + CACHE_EDGE_OVERHEAD_BYTES)
            + (6 + 1 + CACHE_ENTRY_OVERHEAD_BYTES + 10 + CACHE_EDGE_OVERHEAD_BYTES);
        assert_eq!(stats.memory_bytes, expected as u64);
    }

    #[test]
    fn test_entry_info() {
        let cache = DependencyCache::new();
        cache.set("user:2", json!(1), TTL, NO_DEPS).unwrap();
        cache.set("post:1", json!(1), TTL, ["user:2"]).unwrap();

        let info = cache.entry_info("user:2").unwrap().expect("entry exists");
        assert_eq!(info.ttl, TTL);
        assert_eq!(info.dependents, vec!["post:1"]);
        assert!(cache.entry_info("nope").unwrap().is_none());
    }
}
