//! Canonical JSON rendering for cache and resolution keys.
//!
//! Keys derived from JSON parameters must not depend on map insertion order,
//! so objects are rendered with their keys sorted, recursively, and with no
//! whitespace. Arrays keep their order because order is meaningful there.

use serde_json::Value;

/// Render `value` as canonical JSON: sorted object keys, compact separators.
///
/// Two structurally equal values always produce the same string, making the
/// output safe to embed in cache keys and resolution signatures.
pub(crate) fn canonical(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let quoted =
                    serde_json::to_string(key).expect("string serialization is infallible");
                out.push_str(&quoted);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
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
        // Scalars already have a single compact rendering.
        other => out.push_str(&other.to_string()),
    }
}
