//! Property-Based Tests for Cascading Invalidation
//!
//! **Property: Transitive Closure**
//!
//! For any dependency graph built in insertion order, invalidating a key
//! removes exactly that key and every key that transitively depends on it,
//! and leaves every other entry and its back-edges intact.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use bulwark_storage::cache::{fingerprint, DependencyCache, DependencyExtractor, ShapeExtractor};
use proptest::prelude::*;
use serde_json::json;

const TTL: Duration = Duration::from_secs(300);

// ============================================================================
// PROPERTY TEST STRATEGIES
// ============================================================================

/// A DAG over `n` nodes where node `i` may depend only on nodes `< i`.
///
/// Each inner vec lists the dependencies of the node at that index.
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..14).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    proptest::collection::vec(0..i, 0..3).boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

fn node_key(i: usize) -> String {
    format!("node:{}", i)
}

fn build_cache(graph: &[Vec<usize>]) -> DependencyCache {
    let cache = DependencyCache::new();
    for (i, deps) in graph.iter().enumerate() {
        cache
            .set(
                node_key(i),
                json!({ "n": i }),
                TTL,
                deps.iter().map(|d| node_key(*d)),
            )
            .unwrap();
    }
    cache
}

/// Reference closure computed over the graph directly.
fn expected_closure(graph: &[Vec<usize>], root: usize) -> BTreeSet<usize> {
    let mut closure = BTreeSet::from([root]);
    let mut changed = true;
    while changed {
        changed = false;
        for (i, deps) in graph.iter().enumerate() {
            if !closure.contains(&i) && deps.iter().any(|d| closure.contains(d)) {
                closure.insert(i);
                changed = true;
            }
        }
    }
    closure
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn invalidate_removes_exactly_the_closure(
        (graph, root) in dag_strategy().prop_flat_map(|g| {
            let n = g.len();
            (Just(g), 0..n)
        })
    ) {
        let cache = build_cache(&graph);
        let expected = expected_closure(&graph, root);

        let removed = cache.invalidate(&node_key(root)).unwrap();
        prop_assert_eq!(removed, expected.len());

        for i in 0..graph.len() {
            let present = cache.contains(&node_key(i)).unwrap();
            prop_assert_eq!(present, !expected.contains(&i), "node {}", i);
        }

        let stats = cache.stats().unwrap();
        prop_assert_eq!(stats.cascade_invalidations as usize, expected.len() - 1);
    }

    #[test]
    fn survivors_never_point_at_removed_dependents(
        (graph, root) in dag_strategy().prop_flat_map(|g| {
            let n = g.len();
            (Just(g), 0..n)
        })
    ) {
        let cache = build_cache(&graph);
        cache.invalidate(&node_key(root)).unwrap();

        let live: HashSet<String> = cache.keys().unwrap().into_iter().collect();
        for key in &live {
            for dependent in cache.dependents_of(key).unwrap() {
                prop_assert!(live.contains(&dependent), "{} -> {}", key, dependent);
            }
        }
        // Invalidation never leaves a dangling forward reference in a DAG
        // built in dependency order.
        prop_assert_eq!(cache.cleanup_orphan_dependencies().unwrap(), 0);
    }

    #[test]
    fn second_invalidation_is_a_no_op(
        graph in dag_strategy(),
    ) {
        let cache = build_cache(&graph);
        let first = cache.invalidate(&node_key(0)).unwrap();
        prop_assert!(first >= 1);
        prop_assert_eq!(cache.invalidate(&node_key(0)).unwrap(), 0);
    }

    #[test]
    fn fingerprint_is_stable_for_equal_params(page in 0u32..1000, tag in "[a-z]{1,8}") {
        let a = fingerprint("posts", &json!({"page": page, "tag": tag.clone()}));
        let b = fingerprint("posts", &json!({"tag": tag, "page": page}));
        prop_assert_eq!(a, b);
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn extracted_dependencies_drive_cascade() {
    let cache = DependencyCache::new();
    cache
        .set("category:5", json!({"__typename": "Category", "id": 5}), TTL, Vec::<String>::new())
        .unwrap();

    let listing = json!({
        "posts": [
            {"__typename": "Post", "id": 1, "category": {"__typename": "Category", "id": 5}}
        ]
    });
    let key = fingerprint("posts", &json!({"page": 1}));
    let deps = ShapeExtractor.dependencies(&key, &listing);
    assert_eq!(deps, vec!["category:5", "post:1"]);
    cache.set(key.clone(), listing, TTL, deps).unwrap();

    assert_eq!(cache.dependents_of("category:5").unwrap(), vec![key.clone()]);
    assert_eq!(cache.invalidate_by_entity_type("category").unwrap(), 2);
    assert!(!cache.contains(&key).unwrap());
}

#[tokio::test(start_paused = true)]
async fn expiry_cascades_exactly_once() {
    let cache = DependencyCache::new();
    cache
        .set("user:1", json!("ann"), Duration::from_millis(50), Vec::<String>::new())
        .unwrap();
    cache.set("post:1", json!(1), TTL, ["user:1"]).unwrap();
    cache.set("feed:home", json!([1]), TTL, ["post:1"]).unwrap();

    tokio::time::advance(Duration::from_millis(51)).await;

    assert_eq!(cache.get("user:1").unwrap(), None);
    assert_eq!(cache.get("user:1").unwrap(), None);
    assert!(cache.is_empty().unwrap());

    let stats = cache.stats().unwrap();
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.deletes, 3);
    assert_eq!(stats.cascade_invalidations, 2);
    assert_eq!(stats.misses, 2);
}
