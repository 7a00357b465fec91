//! Canonical JSON encoding and content digests.
//!
//! Canonical form:
//! - object keys in code point order (UTF-8 byte order), which
//!   `serde_json::Map` keeps without the `preserve_order` feature
//! - integer-valued floats written as integers; NaN/Infinity rejected
//! - compact separators for hashing, pretty-printed for artifact files
//!
//! Every content hash in the run (policy specs, cohort, config, artifacts)
//! is a SHA-256 hex digest over this encoding.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::domain::error::{EvalError, Result};

const I64_MIN_F64: f64 = -9.223372036854775808e18;
// 2^63; `i64::MAX as f64` rounds up to this, which does not fit.
const I64_END_F64: f64 = 9.223372036854775808e18;

fn normalize_numbers(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), normalize_numbers(v)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(normalize_numbers).collect::<Result<Vec<_>>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(EvalError::InvalidConfig(
                "NaN/Infinity not permitted in canonical JSON".to_string(),
            )),
            Some(f) if f.fract() == 0.0 && f >= I64_MIN_F64 && f < I64_END_F64 => {
                Ok(Value::Number(Number::from(f as i64)))
            }
            _ => Ok(Value::Number(n.clone())),
        },
        other => Ok(other.clone()),
    }
}

/// Normalize a JSON value. Rebuilt maps come back key-sorted.
pub fn canonical_value(value: &Value) -> Result<Value> {
    normalize_numbers(value)
}

/// Compact canonical encoding.
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&canonical_value(value)?)?)
}

/// Pretty canonical encoding, newline-terminated, for artifact files.
pub fn canonical_json_pretty(value: &Value) -> Result<String> {
    let mut out = serde_json::to_string_pretty(&canonical_value(value)?)?;
    out.push('\n');
    Ok(out)
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of the canonical JSON of `value`.
pub fn compute_digest(value: &Value) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Digest of any serializable document.
pub fn digest_of<T: Serialize>(doc: &T) -> Result<String> {
    compute_digest(&serde_json::to_value(doc)?)
}

/// Digest of a JSON object with one top-level field removed.
///
/// Used for self-hashing documents (cohorts) and for identities that must
/// not depend on themselves (run ids).
pub fn digest_without_field(value: &Value, field: &str) -> Result<String> {
    let mut stripped = value.clone();
    if let Value::Object(map) = &mut stripped {
        map.remove(field);
    }
    compute_digest(&stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_valued_floats_collapse() {
        let canonical = canonical_json(&json!({ "value": 1.0, "neg": -2.0 })).expect("canonical");
        assert_eq!(canonical, r#"{"neg":-2,"value":1}"#);
    }

    #[test]
    fn fractional_floats_survive() {
        let canonical = canonical_json(&json!({ "value": 1.5 })).expect("canonical");
        assert_eq!(canonical, r#"{"value":1.5}"#);
    }

    #[test]
    fn floats_beyond_i64_stay_floats() {
        let canonical = canonical_json(&json!({ "v": 9.223372036854775808e18 })).expect("canonical");
        assert_ne!(canonical, format!("{{\"v\":{}}}", i64::MAX));
        let back: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(back["v"].as_f64(), Some(9.223372036854775808e18));

        let canonical = canonical_json(&json!({ "v": -9.223372036854775808e18 })).expect("canonical");
        assert_eq!(canonical, format!("{{\"v\":{}}}", i64::MIN));
    }

    #[test]
    fn keys_sort_by_code_point() {
        // U+FF21 sorts before U+1D538 by code point but after it in UTF-16.
        let canonical = canonical_json(&json!({ "\u{1d538}": 2, "\u{ff21}": 1, "b": 0 })).expect("canonical");
        assert_eq!(canonical, "{\"b\":0,\"\u{ff21}\":1,\"\u{1d538}\":2}");
    }

    #[test]
    fn key_order_does_not_change_digest() {
        let a = json!({ "b": 1, "a": { "y": [1, 2], "x": null } });
        let b = json!({ "a": { "x": null, "y": [1, 2] }, "b": 1 });
        assert_eq!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn pretty_output_is_newline_terminated() {
        let out = canonical_json_pretty(&json!({ "z": 1, "a": 2 })).expect("pretty");
        assert!(out.ends_with("}\n"));
        assert!(out.find("\"a\"").unwrap() < out.find("\"z\"").unwrap());
    }

    #[test]
    fn stripped_field_is_ignored() {
        let with = json!({ "kind": "cohort", "hash": "abc" });
        let other = json!({ "kind": "cohort", "hash": "def" });
        assert_eq!(
            digest_without_field(&with, "hash").unwrap(),
            digest_without_field(&other, "hash").unwrap()
        );
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let d = compute_digest(&json!({ "k": "v" })).unwrap();
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
