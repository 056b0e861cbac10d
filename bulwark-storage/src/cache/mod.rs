//! Dependency-aware response cache.
//!
//! Cached responses are keyed by plain strings and linked into a dependency
//! graph. Invalidating an entry sweeps every entry that transitively
//! depends on it, so a change to `category:5` also drops the listing pages
//! that embedded it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bulwark_storage::cache::DependencyCache;
//! use serde_json::json;
//!
//! let cache = DependencyCache::new();
//! let ttl = Duration::from_secs(300);
//! cache.set("category:5", json!({"name": "news"}), ttl, Vec::<String>::new()).unwrap();
//! cache.set("posts:page-1", json!([1, 2]), ttl, ["category:5"]).unwrap();
//!
//! assert_eq!(cache.invalidate("category:5").unwrap(), 2);
//! assert!(cache.get("posts:page-1").unwrap().is_none());
//! ```

pub mod dependencies;
pub mod dependency_cache;
pub mod entry;
pub mod key;
pub mod traits;

pub use dependencies::{DependencyExtractor, NoDependencies, ShapeExtractor};
pub use dependency_cache::DependencyCache;
pub use entry::{CacheEntry, CacheEntryInfo};
pub use key::{entity_key, entity_type_of, fingerprint, KEY_SEPARATOR};
pub use traits::{CacheEfficiency, CacheStats};
