//! Stored row record.

use super::backend::BackendError;
use ormkit_proto::Row;
use rkyv::{Archive, Deserialize, Serialize};

/// A row as written to sled.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct StoredRow {
    /// Insertion sequence; orders rows within an entity type.
    pub seq: u64,

    /// Column values.
    pub row: Row,
}

impl StoredRow {
    /// Create a stored row.
    pub fn new(seq: u64, row: Row) -> Self {
        Self { seq, row }
    }

    /// Serialize the record to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BackendError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| BackendError::Encoding(e.to_string()))
    }

    /// Deserialize a record from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BackendError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| BackendError::Encoding(e.to_string()))
    }
}
