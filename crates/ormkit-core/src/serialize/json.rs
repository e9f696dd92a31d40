//! Raw value to JSON conversion.

use ormkit_proto::{PrimaryKey, Value};

/// Convert a runtime value to JSON.
///
/// Numbers stay numbers, timestamps are integer microseconds, and UUIDs
/// and binary data render as lowercase hex strings.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int32(i) => serde_json::json!(i),
        Value::Int64(i) => serde_json::json!(i),
        Value::Float32(f) => serde_json::json!(f),
        Value::Float64(f) => serde_json::json!(f),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        Value::Timestamp(t) => serde_json::json!(t),
        Value::Uuid(u) => serde_json::Value::String(hex::encode(u)),
    }
}

/// Convert a primary key to JSON: a scalar for single-column keys, an
/// array in key-column order for composite keys.
pub fn key_to_json(key: &PrimaryKey) -> serde_json::Value {
    let mut values: Vec<serde_json::Value> = key.values().iter().map(value_to_json).collect();
    if values.len() == 1 {
        values.remove(0)
    } else {
        serde_json::Value::Array(values)
    }
}
