//! Storage backend abstraction consumed by the session layer.

use crate::error::Error;
use ormkit_proto::{ChangeBatch, PrimaryKey, Row};
use thiserror::Error as ThisError;

/// Errors a storage backend reports.
#[derive(Debug, ThisError)]
pub enum BackendError {
    /// A write would break referential or key integrity.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The batch was cut off part-way; its effect is unknown.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Underlying sled failure.
    #[error("sled error: {0}")]
    Storage(#[from] sled::Error),

    /// A stored row could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::ConstraintViolation(msg) => Error::ConstraintViolation(msg),
            BackendError::Interrupted(_) => Error::FlushInterrupted,
            other => Error::Backend(other.to_string()),
        }
    }
}

/// Request for the rows of a to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedRequest {
    /// Owner entity type.
    pub owner_entity: String,
    /// Owner primary key.
    pub owner_key: PrimaryKey,
    /// To-many relation name on the owner.
    pub relation: String,
    /// Member entity type.
    pub target_entity: String,
    /// Member columns holding the owner's key, in owner key order.
    pub join_columns: Vec<String>,
}

/// A store of rows the session reads from and flushes to.
///
/// Calls are synchronous; a backend that talks to a remote store blocks
/// the calling session until the call completes.
pub trait StorageBackend: Send + Sync {
    /// Load one row by primary key.
    fn load_by_key(&self, entity: &str, key: &PrimaryKey) -> Result<Option<Row>, BackendError>;

    /// Load the member rows of a to-many relation, in the relation's
    /// natural (insertion) order.
    fn load_related(&self, request: &RelatedRequest) -> Result<Vec<Row>, BackendError>;

    /// Apply an ordered change batch atomically.
    fn apply_change_batch(&self, batch: &ChangeBatch) -> Result<(), BackendError>;
}
