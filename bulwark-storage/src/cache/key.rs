//! Cache key construction.
//!
//! Keys are plain strings of the form `<entity-type>:<discriminator>`. The
//! prefix before the first [`KEY_SEPARATOR`] is the entity-type tag used by
//! type-wide invalidation.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Separator between the entity-type tag and the rest of the key.
pub const KEY_SEPARATOR: char = ':';

/// Hex characters of the parameter digest kept in a fingerprint.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Fingerprint a request: `<endpoint>:<digest of canonical params>`.
///
/// `serde_json` maps are ordered by key, so two parameter objects that
/// differ only in insertion order produce the same fingerprint.
pub fn fingerprint(endpoint: &str, params: &Value) -> String {
    let canonical = params.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!(
        "{}{}{}",
        endpoint,
        KEY_SEPARATOR,
        &digest[..FINGERPRINT_HEX_LEN]
    )
}

/// Key for a single entity, e.g. `post:42`.
pub fn entity_key(entity_type: &str, id: impl std::fmt::Display) -> String {
    format!("{}{}{}", entity_type, KEY_SEPARATOR, id)
}

/// Entity-type tag of a key, if it has one.
pub fn entity_type_of(key: &str) -> Option<&str> {
    key.split_once(KEY_SEPARATOR)
        .map(|(prefix, _)| prefix)
        .filter(|prefix| !prefix.is_empty())
}
