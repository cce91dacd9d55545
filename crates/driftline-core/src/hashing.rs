//! # Content Hashing
//!
//! SHA-256 over a canonical JSON rendering, so that two structurally equal
//! definitions always hash the same regardless of key order or whitespace.
//!
//! ```text
//!  {"b": 1,  "a": [true]}   ─┐
//!                            ├──► canonical: {"a":[true],"b":1} ──► sha256 hex
//!  { "a":[ true ], "b":1 }  ─┘
//! ```

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Renders `value` as compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
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
                // String keys serialize infallibly.
                out.push_str(&Value::String((*key).clone()).to_string());
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash of a JSON definition.
pub fn content_hash(value: &Value) -> String {
    bytes_hash(canonical_json(value).as_bytes())
}

/// Hash of raw content that could not be parsed as JSON.
///
/// Line endings are normalised to LF first.
pub fn raw_content_hash(content: &str) -> String {
    bytes_hash(content.replace("\r\n", "\n").as_bytes())
}

fn bytes_hash(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}
