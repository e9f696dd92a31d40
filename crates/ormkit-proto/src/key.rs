//! Primary key values.
//!
//! A primary key is an ordered list of hashable components, one per key
//! column. Keys that include a reference to another entity carry that
//! entity's key columns inline, so the component list is always flat.

use crate::error::Error;
use crate::value::Value;
use std::fmt;

/// Type tag for encoded key components.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyTag {
    Bool = 1,
    Int32 = 2,
    Int64 = 3,
    String = 4,
    Bytes = 5,
    Timestamp = 6,
    Uuid = 7,
}

/// A single primary key component.
///
/// Floating point and null values cannot identify a row and have no
/// counterpart here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// Boolean component.
    Bool(bool),
    /// 32-bit integer component.
    Int32(i32),
    /// 64-bit integer component.
    Int64(i64),
    /// String component.
    String(String),
    /// Binary component.
    Bytes(Vec<u8>),
    /// Timestamp component (microseconds since Unix epoch).
    Timestamp(i64),
    /// UUID component.
    Uuid([u8; 16]),
}

impl TryFrom<Value> for KeyValue {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(KeyValue::Bool(b)),
            Value::Int32(i) => Ok(KeyValue::Int32(i)),
            Value::Int64(i) => Ok(KeyValue::Int64(i)),
            Value::String(s) => Ok(KeyValue::String(s)),
            Value::Bytes(b) => Ok(KeyValue::Bytes(b)),
            Value::Timestamp(t) => Ok(KeyValue::Timestamp(t)),
            Value::Uuid(u) => Ok(KeyValue::Uuid(u)),
            other => Err(Error::InvalidKey(format!(
                "{} values cannot be part of a primary key",
                other.type_name()
            ))),
        }
    }
}

impl From<KeyValue> for Value {
    fn from(v: KeyValue) -> Self {
        match v {
            KeyValue::Bool(b) => Value::Bool(b),
            KeyValue::Int32(i) => Value::Int32(i),
            KeyValue::Int64(i) => Value::Int64(i),
            KeyValue::String(s) => Value::String(s),
            KeyValue::Bytes(b) => Value::Bytes(b),
            KeyValue::Timestamp(t) => Value::Timestamp(t),
            KeyValue::Uuid(u) => Value::Uuid(u),
        }
    }
}

impl From<&KeyValue> for Value {
    fn from(v: &KeyValue) -> Self {
        v.clone().into()
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Value::from(self).fmt(f)
    }
}

/// A primary key: the ordered component values of an entity's key columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryKey(Vec<KeyValue>);

impl PrimaryKey {
    /// Create a key from its components, in declared key-column order.
    pub fn new(components: Vec<KeyValue>) -> Result<Self, Error> {
        if components.is_empty() {
            return Err(Error::InvalidKey("a primary key needs at least one component".into()));
        }
        Ok(Self(components))
    }

    /// Create a single-column key.
    pub fn single(component: impl Into<KeyValue>) -> Self {
        Self(vec![component.into()])
    }

    /// Build a key from column values.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Result<Self, Error> {
        let components = values
            .into_iter()
            .map(KeyValue::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(components)
    }

    /// Key components in declared order.
    pub fn components(&self) -> &[KeyValue] {
        &self.0
    }

    /// Component values converted back to runtime values.
    pub fn values(&self) -> Vec<Value> {
        self.0.iter().map(Value::from).collect()
    }

    /// Number of key columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Keys are never empty; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check if the key spans more than one column.
    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }

    /// Encode the key to bytes usable as a storage key suffix.
    ///
    /// Format, per component:
    /// - Tag (1 byte)
    /// - Fixed-width big-endian payload, or a 4-byte big-endian length
    ///   followed by the raw bytes for strings and binary data
    ///
    /// The encoding is injective, so two keys collide only when equal.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 9);
        for component in &self.0 {
            match component {
                KeyValue::Bool(b) => {
                    buf.push(KeyTag::Bool as u8);
                    buf.push(u8::from(*b));
                }
                KeyValue::Int32(i) => {
                    buf.push(KeyTag::Int32 as u8);
                    // Flip the sign bit so byte order matches numeric order.
                    buf.extend_from_slice(&((*i as u32) ^ (1 << 31)).to_be_bytes());
                }
                KeyValue::Int64(i) => {
                    buf.push(KeyTag::Int64 as u8);
                    buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
                }
                KeyValue::Timestamp(t) => {
                    buf.push(KeyTag::Timestamp as u8);
                    buf.extend_from_slice(&((*t as u64) ^ (1 << 63)).to_be_bytes());
                }
                KeyValue::String(s) => {
                    buf.push(KeyTag::String as u8);
                    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                KeyValue::Bytes(b) => {
                    buf.push(KeyTag::Bytes as u8);
                    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    buf.extend_from_slice(b);
                }
                KeyValue::Uuid(u) => {
                    buf.push(KeyTag::Uuid as u8);
                    buf.extend_from_slice(u);
                }
            }
        }
        buf
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return single.fmt(f);
        }
        f.write_str("(")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            component.fmt(f)?;
        }
        f.write_str(")")
    }
}

macro_rules! key_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for KeyValue {
                fn from(v: $ty) -> Self {
                    KeyValue::$variant(v.into())
                }
            }

            impl From<$ty> for PrimaryKey {
                fn from(v: $ty) -> Self {
                    PrimaryKey::single(v)
                }
            }
        )*
    };
}

key_value_from! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    String => String,
    &str => String,
    [u8; 16] => Uuid,
}
