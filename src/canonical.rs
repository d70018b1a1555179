//! Canonical JSON: deterministic encoding used for message signing.
//!
//! Keys are sorted ascending at every object level, recursively; arrays
//! preserve order; output carries no insignificant whitespace. This is the
//! shared primitive behind both message signing (`identity.rs`) and
//! capability-gossip signing (`capability.rs`) — generalizing the ad hoc
//! canonical signing string the teacher builds by hand in
//! `freeq-sdk/src/client.rs` (`format!("{did}\0{target}\0{text}\0{timestamp}")`)
//! into a structural canonicalizer that works over arbitrary JSON values,
//! as `spec.md` §6 requires.

use serde::Serialize;
use serde_json::Value;

/// Recursively sort object keys, leaving arrays and scalars untouched.
fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_value(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Serialize `value` to canonical JSON bytes: keys sorted recursively, no
/// whitespace. `serde_json`'s compact writer already omits whitespace; the
/// sorting pass is what makes the encoding deterministic across differing
/// struct field orders.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let raw = serde_json::to_value(value)?;
    let sorted = sort_value(raw);
    serde_json::to_vec(&sorted)
}

/// Same as [`to_canonical_bytes`] but returns a `String`.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    to_canonical_bytes(value).map(|bytes| {
        // Safety: serde_json always emits valid UTF-8.
        String::from_utf8(bytes).expect("canonical JSON is valid UTF-8")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": 1, "y": 2}, "c": [3, 2, 1]});
        let bytes = to_canonical_bytes(&value).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, r#"{"a":{"y":2,"z":1},"b":1,"c":[3,2,1]}"#);
    }

    #[test]
    fn same_value_different_field_order_matches() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            to_canonical_bytes(&a).unwrap(),
            to_canonical_bytes(&b).unwrap()
        );
    }
}
