//! Scalar types for entity fields.

use ormkit_proto::Value;

/// Scalar data types an entity field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    /// Boolean value.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 string.
    String,
    /// Binary data.
    Bytes,
    /// Timestamp (microseconds since Unix epoch).
    Timestamp,
    /// UUID (128-bit identifier).
    Uuid,
}

impl ScalarType {
    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarType::Int32 | ScalarType::Int64 | ScalarType::Float32 | ScalarType::Float64
        )
    }

    /// Check if a value of this type can serve as a key component.
    pub fn is_keyable(&self) -> bool {
        !matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    /// Convert a non-null value to this type.
    ///
    /// Lossless widenings (int32 to int64, int64 to timestamp, float32 to
    /// float64, integers to floats) are applied; anything else is rejected.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (ScalarType::Bool, v @ Value::Bool(_)) => Some(v),
            (ScalarType::Int32, v @ Value::Int32(_)) => Some(v),
            (ScalarType::Int32, Value::Int64(i)) => i32::try_from(i).ok().map(Value::Int32),
            (ScalarType::Int64, Value::Int32(i)) => Some(Value::Int64(i as i64)),
            (ScalarType::Int64, v @ Value::Int64(_)) => Some(v),
            (ScalarType::Float32, v @ Value::Float32(_)) => Some(v),
            (ScalarType::Float64, Value::Float32(f)) => Some(Value::Float64(f as f64)),
            (ScalarType::Float64, v @ Value::Float64(_)) => Some(v),
            (ScalarType::Float64, Value::Int32(i)) => Some(Value::Float64(i as f64)),
            (ScalarType::String, v @ Value::String(_)) => Some(v),
            (ScalarType::Bytes, v @ Value::Bytes(_)) => Some(v),
            (ScalarType::Timestamp, v @ Value::Timestamp(_)) => Some(v),
            (ScalarType::Timestamp, Value::Int64(t)) => Some(Value::Timestamp(t)),
            (ScalarType::Uuid, v @ Value::Uuid(_)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_type_checks() {
        assert!(ScalarType::Int32.is_numeric());
        assert!(ScalarType::Float64.is_numeric());
        assert!(!ScalarType::String.is_numeric());

        assert!(ScalarType::Uuid.is_keyable());
        assert!(!ScalarType::Float32.is_keyable());
    }

    #[test]
    fn test_coerce() {
        assert_eq!(ScalarType::Int64.coerce(Value::Int32(7)), Some(Value::Int64(7)));
        assert_eq!(ScalarType::Int32.coerce(Value::Int64(7)), Some(Value::Int32(7)));
        assert_eq!(ScalarType::Int32.coerce(Value::Int64(i64::MAX)), None);
        assert_eq!(ScalarType::String.coerce(Value::Int32(1)), None);
        assert_eq!(
            ScalarType::Timestamp.coerce(Value::Int64(1_704_067_200_000_000)),
            Some(Value::Timestamp(1_704_067_200_000_000))
        );
    }
}
