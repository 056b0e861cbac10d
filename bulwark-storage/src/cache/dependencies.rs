//! Dependency derivation from response shapes.

use std::collections::BTreeSet;

use serde_json::Value;

use super::key::entity_key;

/// Derives the cache keys a response's correctness relies on.
pub trait DependencyExtractor: Send + Sync {
    /// Dependency keys for the response stored under `key`.
    fn dependencies(&self, key: &str, response: &Value) -> Vec<String>;
}

/// Extractor that records no dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyExtractor for NoDependencies {
    fn dependencies(&self, _key: &str, _response: &Value) -> Vec<String> {
        Vec::new()
    }
}

/// Walks the response and emits `<type>:<id>` for every embedded entity.
///
/// An object is an entity when it carries an `id` (string or number) and a
/// type tag in `__typename` or `type`. The tag is lower-cased. Results are
/// deduplicated, sorted, and never include `key` itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeExtractor;

impl ShapeExtractor {
    fn entity_of(object: &serde_json::Map<String, Value>) -> Option<String> {
        let type_tag = object
            .get("__typename")
            .or_else(|| object.get("type"))
            .and_then(Value::as_str)?;
        let id = match object.get("id")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(entity_key(&type_tag.to_lowercase(), id))
    }
}

impl DependencyExtractor for ShapeExtractor {
    fn dependencies(&self, key: &str, response: &Value) -> Vec<String> {
        let mut found = BTreeSet::new();
        let mut pending = vec![response];

        while let Some(value) = pending.pop() {
            match value {
                Value::Object(object) => {
                    if let Some(entity) = Self::entity_of(object) {
                        found.insert(entity);
                    }
                    pending.extend(object.values());
                }
                Value::Array(items) => pending.extend(items.iter()),
                _ => {}
            }
        }

        found.remove(key);
        found.into_iter().collect()
    }
}
