//! Content fingerprints for change detection.
//!
//! A fingerprint is the SHA-256 of a canonical JSON serialization of a
//! document. Two documents that differ only in key order hash identically;
//! any value-level difference changes the hash.
//!
//! # Algorithm
//!
//! 1. Reject non-container roots with [`FingerprintError::NotSortable`]
//!    (a bare string or number has no keys to order).
//! 2. Recursively rebuild the document with object keys sorted
//!    lexicographically at every depth. Arrays keep their order.
//! 3. Serialize compactly and hash with SHA-256, formatted as lowercase hex.
//!
//! Nesting beyond [`MAX_DEPTH`] is rejected with
//! [`FingerprintError::TooDeep`]. `serde_json::Value` cannot be cyclic, so
//! the depth bound is what keeps canonicalization finite for documents built
//! from foreign object graphs.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use sync_harness_core::fingerprint::fingerprint;
//!
//! let a = fingerprint(&json!({ "a": 1, "b": { "x": 1, "y": 2 } })).unwrap();
//! let b = fingerprint(&json!({ "b": { "y": 2, "x": 1 }, "a": 1 })).unwrap();
//! assert_eq!(a, b);
//! ```

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::FingerprintError;
use crate::mapping::dot;

/// Maximum nesting depth accepted by [`canonicalize`].
pub const MAX_DEPTH: usize = 64;

/// Rebuild `value` with every object's keys sorted.
pub fn canonicalize(value: &Value) -> Result<Value, FingerprintError> {
    match value {
        Value::Object(_) | Value::Array(_) => sort_keys(value, 0),
        other => Err(FingerprintError::NotSortable {
            found: dot::type_name(other).to_string(),
        }),
    }
}

fn sort_keys(value: &Value, depth: usize) -> Result<Value, FingerprintError> {
    if depth > MAX_DEPTH {
        return Err(FingerprintError::TooDeep { limit: MAX_DEPTH });
    }
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key.as_str()], depth + 1)?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| sort_keys(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        scalar => Ok(scalar.clone()),
    }
}

/// Canonicalize and hash a document.
pub fn fingerprint(value: &Value) -> Result<String, FingerprintError> {
    let canonical = canonicalize(value)?;
    Ok(digest(canonical.to_string().as_bytes()))
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({ "z": [ { "b": 1, "a": 2 } ], "a": { "d": null, "c": true } });
        let b = json!({ "a": { "c": true, "d": null }, "z": [ { "a": 2, "b": 1 } ] });
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_array_order_matters() {
        let a = fingerprint(&json!({ "list": [1, 2] })).unwrap();
        let b = fingerprint(&json!({ "list": [2, 1] })).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_value_change_changes_hash() {
        let a = fingerprint(&json!({ "name": "Ann" })).unwrap();
        let b = fingerprint(&json!({ "name": "Anne" })).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_scalar_is_not_sortable() {
        let err = fingerprint(&json!("just a string")).unwrap_err();
        assert_eq!(err, FingerprintError::NotSortable { found: "string".into() });
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let mut doc = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            doc = json!({ "n": doc });
        }
        assert_eq!(
            fingerprint(&doc).unwrap_err(),
            FingerprintError::TooDeep { limit: MAX_DEPTH }
        );
    }

    #[test]
    fn test_canonical_keys_sorted() {
        let canonical = canonicalize(&json!({ "b": 1, "a": 2 })).unwrap();
        let keys: Vec<_> = canonical.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
