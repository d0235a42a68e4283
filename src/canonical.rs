//! --- LogiChain Canonical Encoding ---
//!
//! Every digest in the system (transaction hashes, block hashes, vote signing
//! payloads) is taken over the same encoding: compact JSON with object keys
//! sorted lexicographically at every nesting level. Keys are sorted here
//! explicitly rather than relying on the map ordering of `serde_json`, so the
//! output does not change if a dependency enables `preserve_order`.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes `value` into its canonical byte form.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::with_capacity(256);
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Writes an already-built JSON value in canonical form.
pub fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_entry(key, &map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// Writes a single `"key":value` pair.
pub fn write_entry(key: &str, value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    serde_json::to_writer(&mut *out, key)?;
    out.push(b':');
    write_value(value, out)
}

/// SHA-256 over the canonical encoding, hex encoded.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = to_canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted_at_every_level() {
        let value = json!({
            "zeta": 1,
            "alpha": {"b": [3, {"y": true, "x": null}], "a": "s"},
        });
        let bytes = to_canonical_bytes(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":{"a":"s","b":[3,{"x":null,"y":true}]},"zeta":1}"#
        );
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = json!({"from": "a", "to": "b", "amount": 10});
        let b = json!({"amount": 10, "to": "b", "from": "a"});
        assert_eq!(canonical_digest(&a).unwrap(), canonical_digest(&b).unwrap());
    }
}
