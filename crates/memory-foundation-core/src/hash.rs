//! Canonical serialization and SHA-256 digests shared by every store.
//!
//! A record is encoded by serializing it to a JSON value, sorting every
//! object's keys recursively and writing the result without whitespace. Two
//! values that serialize to the same JSON tree always produce the same bytes,
//! regardless of struct field order or map insertion order.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Head of every hash chain before its first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HashError {
    #[error("canonical encoding failed: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for HashError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

#[must_use]
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            let mut sorted = Map::new();
            for (key, nested) in entries {
                sorted.insert(key, sort_keys(nested));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Encode `value` as whitespace-free JSON with recursively sorted keys.
///
/// # Errors
/// Returns [`HashError::Encoding`] when `value` cannot be represented as JSON
/// (for example a map with non-string keys).
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let tree = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_keys(tree))?)
}

/// SHA-256 of the canonical encoding of `value`.
///
/// # Errors
/// Returns [`HashError::Encoding`] when `value` cannot be canonically encoded.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    Ok(sha256_hex(&canonical_json(value)?))
}

/// SHA-256 of the canonical encoding of `value` followed by `previous`. Used
/// for chained records whose digest must commit to their predecessor.
///
/// # Errors
/// Returns [`HashError::Encoding`] when `value` cannot be canonically encoded.
pub fn chained_digest<T: Serialize + ?Sized>(value: &T, previous: &str) -> Result<String, HashError> {
    let mut payload = canonical_json(value)?;
    payload.push_str(previous);
    Ok(sha256_hex(&payload))
}

/// Merkle root over a set of leaf hashes.
///
/// Leaves are sorted first, so the root does not depend on the order in which
/// they were collected. Each level hashes adjacent pairs as
/// `sha256(left ++ right)`; an odd trailing node is paired with itself. The
/// empty set maps to [`GENESIS_HASH`].
#[must_use]
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return GENESIS_HASH.to_string();
    }

    let mut level: Vec<String> = leaves.to_vec();
    level.sort();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                sha256_hex(&format!("{left}{right}"))
            })
            .collect();
    }
    level.swap_remove(0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys_without_whitespace() {
        let value = json!({"b": 1, "a": {"z": [ {"y": 2, "x": 1} ], "c": null}});
        let encoded = match canonical_json(&value) {
            Ok(encoded) => encoded,
            Err(err) => panic!("encoding failed: {err}"),
        };
        assert_eq!(encoded, r#"{"a":{"c":null,"z":[{"x":1,"y":2}]},"b":1}"#);
    }

    #[test]
    fn merkle_root_of_empty_set_is_genesis() {
        assert_eq!(merkle_root(&[]), GENESIS_HASH);
    }

    #[test]
    fn merkle_root_of_single_leaf_is_the_leaf() {
        let leaf = sha256_hex("leaf");
        assert_eq!(merkle_root(std::slice::from_ref(&leaf)), leaf);
    }

    #[test]
    fn merkle_root_duplicates_odd_trailing_leaf() {
        let mut leaves = vec![sha256_hex("a"), sha256_hex("b"), sha256_hex("c")];
        leaves.sort();
        let left = sha256_hex(&format!("{}{}", leaves[0], leaves[1]));
        let right = sha256_hex(&format!("{}{}", leaves[2], leaves[2]));
        let expected = sha256_hex(&format!("{left}{right}"));
        assert_eq!(merkle_root(&leaves), expected);
    }

    proptest! {
        #[test]
        fn property_merkle_root_ignores_leaf_order(seeds in proptest::collection::vec(any::<u32>(), 0..24), rotate in any::<usize>()) {
            let leaves: Vec<String> = seeds.iter().map(|seed| sha256_hex(&seed.to_string())).collect();
            let mut shuffled = leaves.clone();
            if !shuffled.is_empty() {
                let by = rotate % shuffled.len();
                shuffled.rotate_left(by);
                shuffled.reverse();
            }
            prop_assert_eq!(merkle_root(&leaves), merkle_root(&shuffled));
        }

        #[test]
        fn property_digest_is_deterministic_and_field_sensitive(name in "[a-z]{1,12}", count in any::<u32>()) {
            let first = digest(&json!({"name": name, "count": count}));
            let second = digest(&json!({"count": count, "name": name}));
            let changed = digest(&json!({"name": name, "count": u64::from(count) + 1}));
            prop_assert!(first.is_ok());
            let first = first.unwrap_or_default();
            prop_assert_eq!(&first, &second.unwrap_or_default());
            prop_assert_ne!(&first, &changed.unwrap_or_default());
        }
    }
}
