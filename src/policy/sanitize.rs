//! Payload sanitization and fingerprinting
//!
//! The decision service never sees raw call arguments, only a bounded
//! summary. The fingerprint is the SHA-256 of the summary's canonical
//! (key-sorted, compact) JSON, so identical calls share a cache entry.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Maximum nesting depth kept
pub const MAX_DEPTH: usize = 6;
/// Maximum array elements kept
pub const MAX_ARRAY_LEN: usize = 50;
/// Maximum string length kept, in characters
pub const MAX_STRING_LEN: usize = 512;
/// Maximum object keys kept (in sorted order)
pub const MAX_OBJECT_KEYS: usize = 50;
/// Canonical payload size above which only a digest is kept
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Bound a payload for transmission to the decision service
#[must_use]
pub fn sanitize(value: &Value) -> Value {
    let canonical = canonical_json(value);
    if canonical.len() > MAX_PAYLOAD_BYTES {
        return json!({
            "_truncated": true,
            "bytes": canonical.len(),
            "sha256": sha256_hex(canonical.as_bytes()),
        });
    }
    bound(value, 0)
}

/// Hex SHA-256 of the canonical JSON of a (sanitized) value
#[must_use]
pub fn fingerprint(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

fn bound(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => match s.char_indices().nth(MAX_STRING_LEN) {
            Some((cut, _)) => Value::String(s[..cut].to_string()),
            None => value.clone(),
        },
        Value::Array(_) | Value::Object(_) if depth >= MAX_DEPTH => json!({"_truncated": true}),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(MAX_ARRAY_LEN)
                .map(|v| bound(v, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .take(MAX_OBJECT_KEYS)
                    .map(|(k, v)| (bound_str(k), bound(v, depth + 1)))
                    .collect::<Map<String, Value>>(),
            )
        }
        _ => value.clone(),
    }
}

fn bound_str(s: &str) -> String {
    s.chars().take(MAX_STRING_LEN).collect()
}

/// Compact JSON with object keys sorted at every level
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = json!({"path": "/tmp/a", "mode": {"x": 1, "y": 2}});
        let b = json!({"mode": {"y": 2, "x": 1}, "path": "/tmp/a"});
        assert_eq!(fingerprint(&sanitize(&a)), fingerprint(&sanitize(&b)));
        assert_ne!(fingerprint(&sanitize(&a)), fingerprint(&json!({"path": "/tmp/b"})));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn long_strings_are_cut_on_char_boundary() {
        let s = "é".repeat(600);
        let out = sanitize(&json!({ "s": s }));
        assert_eq!(out["s"].as_str().unwrap().chars().count(), MAX_STRING_LEN);
    }

    #[test]
    fn arrays_and_objects_are_bounded() {
        let items: Vec<u32> = (0..80).collect();
        let mut wide = Map::new();
        for i in 0..70 {
            wide.insert(format!("k{i:03}"), json!(i));
        }

        let out = sanitize(&json!({"items": items, "wide": wide}));

        assert_eq!(out["items"].as_array().unwrap().len(), MAX_ARRAY_LEN);
        let kept = out["wide"].as_object().unwrap();
        assert_eq!(kept.len(), MAX_OBJECT_KEYS);
        assert!(kept.contains_key("k000"));
        assert!(!kept.contains_key("k069"));
    }

    #[test]
    fn deep_nesting_is_truncated() {
        let mut v = json!("leaf");
        for _ in 0..10 {
            v = json!({ "n": v });
        }

        let mut out = &sanitize(&v);
        for _ in 0..MAX_DEPTH {
            out = &out["n"];
        }
        assert_eq!(out, &json!({"_truncated": true}));
    }

    #[test]
    fn oversized_payload_collapses_to_digest() {
        let big = "x".repeat(400);
        let items: Vec<Value> = (0..300).map(|i| json!({ "i": i, "blob": big })).collect();
        let payload = json!({ "items": items });

        let out = sanitize(&payload);

        assert_eq!(out["_truncated"], true);
        assert!(out["bytes"].as_u64().unwrap() > MAX_PAYLOAD_BYTES as u64);
        assert_eq!(out["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn canonical_json_is_compact_and_sorted() {
        assert_eq!(
            canonical_json(&json!({"b": [1, {"d": null, "c": "x"}], "a": true})),
            r#"{"a":true,"b":[1,{"c":"x","d":null}]}"#
        );
    }
}
