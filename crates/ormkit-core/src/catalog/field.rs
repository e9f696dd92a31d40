//! Field metadata for entities.

use super::types::ScalarType;
use ormkit_proto::Value;
use std::fmt;
use std::sync::Arc;

/// A scalar field declared on an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMetadata {
    /// Field name (also its column name).
    pub name: String,
    /// Declared scalar type.
    pub scalar: ScalarType,
    /// Whether the field accepts null.
    pub nullable: bool,
    /// Default value applied when the field is absent at creation.
    pub default: Option<DefaultValue>,
    /// Excluded from serialized output; still stored.
    pub hidden: bool,
    /// Per-field serializer override.
    pub serializer: Option<FieldSerializer>,
}

/// Default value for a field.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    String(String),
}

impl DefaultValue {
    /// Materialize the default as a value of the given scalar type.
    pub fn to_value(&self, scalar: ScalarType) -> Option<Value> {
        let raw = match self {
            DefaultValue::Null => return Some(Value::Null),
            DefaultValue::Bool(b) => Value::Bool(*b),
            DefaultValue::Int(i) => Value::Int64(*i),
            DefaultValue::Float(f) => Value::Float64(*f),
            DefaultValue::String(s) => Value::String(s.clone()),
        };
        scalar.coerce(raw)
    }
}

type FieldSerializeFn = dyn Fn(&Value) -> serde_json::Value + Send + Sync;

/// A user-supplied function that renders a field value in serialized output.
///
/// The function's return type is the output type: a numeric field with a
/// string-producing serializer always serializes as a string.
#[derive(Clone)]
pub struct FieldSerializer(Arc<FieldSerializeFn>);

impl FieldSerializer {
    /// Wrap a serializer function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> serde_json::Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Apply the serializer to a value.
    pub fn apply(&self, value: &Value) -> serde_json::Value {
        (self.0)(value)
    }
}

impl fmt::Debug for FieldSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldSerializer(..)")
    }
}

// Functions cannot be compared. Metadata equality only tracks whether a
// serializer is declared, so rebuilding the same declaration matches.
impl PartialEq for FieldSerializer {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl FieldMetadata {
    /// Create a new non-nullable field.
    pub fn new(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar,
            nullable: false,
            default: None,
            hidden: false,
            serializer: None,
        }
    }

    /// Create a nullable field.
    pub fn optional(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, scalar).nullable()
    }

    /// Allow null values.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Hide the field from serialized output.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Set a serializer override.
    pub fn with_serializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.serializer = Some(FieldSerializer::new(f));
        self
    }

    /// Check if this field has a default value.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Value to use when creation data omits the field.
    pub(crate) fn initial_value(&self) -> Option<Value> {
        match &self.default {
            Some(default) => default.to_value(self.scalar),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    /// Check a value against the declared type, applying widening.
    pub(crate) fn accept(&self, entity: &str, value: Value) -> Result<Value, crate::Error> {
        if value.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err(crate::Error::InvalidData(format!(
                    "{}.{} is not nullable",
                    entity, self.name
                )))
            };
        }
        let found = value.type_name();
        self.scalar.coerce(value).ok_or_else(|| {
            crate::Error::InvalidData(format!(
                "{}.{} expects {:?}, got {}",
                entity, self.name, self.scalar, found
            ))
        })
    }
}
