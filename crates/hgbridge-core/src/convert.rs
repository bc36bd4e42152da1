//! Mapping between [`Value`] and the host's native values.
//!
//! The host side speaks `serde_json::Value`: null, booleans, numbers,
//! strings, arrays and objects. Conversion is a plain recursive walk in each
//! direction; it runs on the host thread right before a handler is invoked
//! and right after it returns.

use serde_json::{Map, Number};

use crate::value::{Struct, Value};

/// Convert a protocol value into its host representation.
pub fn to_host(value: &Value) -> serde_json::Value {
    match value {
        Value::Void => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::Number((*i).into()),
        // Non-finite floats have no JSON number form.
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_host).collect()),
        Value::Struct(map) => {
            let object: Map<String, serde_json::Value> = map
                .iter()
                .map(|(key, item)| (key.clone(), to_host(item)))
                .collect();
            serde_json::Value::Object(object)
        }
        Value::Fault(fault) => {
            serde_json::to_value(fault).unwrap_or(serde_json::Value::Null)
        }
    }
}

/// Convert a host value into a protocol value.
///
/// Numbers become integers when they carry no fractional part and fit in
/// 64 bits, floats otherwise. Unsigned values beyond `i64::MAX` wrap, the
/// same lossy truncation a bigint gets.
pub fn from_host(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Void,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => number_from_host(n),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_host).collect()),
        serde_json::Value::Object(object) => {
            let map: Struct = object
                .iter()
                .map(|(key, item)| (key.clone(), from_host(item)))
                .collect();
            Value::Struct(map)
        }
    }
}

/// Convert a host argument list into positional protocol parameters.
///
/// Anything other than an array yields an empty parameter list.
pub fn params_from_host(args: &serde_json::Value) -> Vec<Value> {
    match args {
        serde_json::Value::Array(items) => items.iter().map(from_host).collect(),
        _ => Vec::new(),
    }
}

fn number_from_host(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        return Value::Integer(i);
    }
    if let Some(u) = n.as_u64() {
        return Value::Integer(u as i64);
    }

    let f = n.as_f64().unwrap_or(0.0);
    // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Value::Integer(f as i64)
    } else {
        Value::Float(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_array_roundtrip_keeps_types() {
        let original = Value::Array(vec![
            Value::Integer(1),
            Value::from("a"),
            Value::Boolean(true),
            Value::Void,
            Value::Array(vec![Value::Float(2.5)]),
        ]);

        let host = to_host(&original);
        assert_eq!(host, json!([1, "a", true, null, [2.5]]));
        assert_eq!(from_host(&host), original);
    }

    #[test]
    fn test_whole_float_becomes_integer() {
        assert_eq!(from_host(&json!(4.0)), Value::Integer(4));
        assert_eq!(from_host(&json!(-0.5)), Value::Float(-0.5));
    }

    #[test]
    fn test_large_unsigned_wraps() {
        assert_eq!(from_host(&json!(u64::MAX)), Value::Integer(-1));
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert_eq!(to_host(&Value::Float(f64::NAN)), serde_json::Value::Null);
    }

    #[test]
    fn test_object_to_struct() {
        let value = from_host(&json!({"state": true, "level": 0.75}));
        let map = value.as_struct().unwrap();
        assert_eq!(map["state"], Value::Boolean(true));
        assert_eq!(map["level"], Value::Float(0.75));
    }

    #[test]
    fn test_fault_to_host() {
        let host = to_host(&Value::fault(-32601, "Method not found: x"));
        assert_eq!(
            host,
            json!({"faultCode": -32601, "faultString": "Method not found: x"})
        );
    }

    #[test]
    fn test_params_from_non_array_is_empty() {
        assert!(params_from_host(&json!({"a": 1})).is_empty());
        assert_eq!(
            params_from_host(&json!(["My log entry", 4])),
            vec![Value::from("My log entry"), Value::Integer(4)]
        );
    }
}
