//! JSON representation of decoded ABI values.
//!
//! Unbounded integers are stored with a tagged encoding so they survive a
//! round trip through the JSON-typed cache without precision loss:
//! `{"type": "bigint", "value": "<decimal-string>"}`.

use alloy::dyn_abi::DynSolValue;
use serde_json::{Value, json};

const BIGINT_TAG: &str = "bigint";

/// Tag an unbounded integer for JSON storage.
pub fn bigint_to_json(decimal: impl std::fmt::Display) -> Value {
    json!({ "type": BIGINT_TAG, "value": decimal.to_string() })
}

/// Recognize the tagged big-integer encoding and return its decimal
/// string, or `None` for any other JSON value.
pub fn json_to_bigint(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.get("type")?.as_str()? != BIGINT_TAG {
        return None;
    }
    obj.get("value")?.as_str()
}

/// Convert a decoded ABI value into its JSON parameter representation.
pub fn value_to_json(value: &DynSolValue) -> Value {
    #[allow(unreachable_patterns)]
    match value {
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Uint(v, _) => bigint_to_json(v),
        DynSolValue::Int(v, _) => bigint_to_json(v),
        DynSolValue::Address(a) => json!(format!("{a:#x}")),
        DynSolValue::Function(f) => json!(format!("0x{}", alloy::hex::encode(f.as_slice()))),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", alloy::hex::encode(&word.as_slice()[..*size])))
        }
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", alloy::hex::encode(bytes))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(value_to_json).collect())
        }
        // Struct values only appear when EIP-712 decoding is enabled.
        other => json!(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, I256, U256};
    use std::str::FromStr;

    #[test]
    fn test_bigint_tag_round_trip() {
        let value = U256::from_str("1000000000000000000000000000000").unwrap();
        let encoded = bigint_to_json(value);
        assert_eq!(
            encoded,
            json!({ "type": "bigint", "value": "1000000000000000000000000000000" })
        );
        assert_eq!(
            json_to_bigint(&encoded),
            Some("1000000000000000000000000000000")
        );
    }

    #[test]
    fn test_bigint_tag_rejects_untagged_values() {
        assert_eq!(json_to_bigint(&json!("123")), None);
        assert_eq!(json_to_bigint(&json!({ "value": "123" })), None);
        assert_eq!(json_to_bigint(&json!({ "type": "other", "value": "1" })), None);
    }

    #[test]
    fn test_negative_int_encoding() {
        let value = I256::from_str("-42").unwrap();
        assert_eq!(
            value_to_json(&DynSolValue::Int(value, 256)),
            json!({ "type": "bigint", "value": "-42" })
        );
    }

    #[test]
    fn test_address_is_lowercase_hex() {
        let addr = Address::repeat_byte(0xAB);
        let encoded = value_to_json(&DynSolValue::Address(addr));
        assert_eq!(encoded, json!("0xabababababababababababababababababababab"));
    }

    #[test]
    fn test_nested_values() {
        let value = DynSolValue::Tuple(vec![
            DynSolValue::Bool(true),
            DynSolValue::Array(vec![DynSolValue::Uint(U256::from(7u64), 256)]),
        ]);
        assert_eq!(
            value_to_json(&value),
            json!([true, [{ "type": "bigint", "value": "7" }]])
        );
    }
}
