//! Deterministic content hashing for job inputs.
//!
//! Two jobs with semantically equal inputs must land on the same digest in
//! any process, so the input is first rewritten into a canonical form:
//! object keys sorted lexicographically, keys whose value is `null` elided,
//! numbers rendered in their shortest round-trip form.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the canonical form of `input`.
pub fn fingerprint(input: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(input, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers without a fraction and floats via the
        // shortest representation that round-trips, which is the
        // normalization we want.
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(_) => out.push_str(&value.to_string()),
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
            // Absent and null-valued keys hash identically.
            let mut entries: Vec<_> = map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
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
    }
}
