//! Core error types.

use ormkit_proto::PrimaryKey;
use thiserror::Error;

/// Errors surfaced by the registry, the session layer, and the serializer.
#[derive(Debug, Error)]
pub enum Error {
    /// No metadata registered for the entity type.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The entity type has no field with this name.
    #[error("unknown field '{field}' on entity {entity}")]
    UnknownField { entity: String, field: String },

    /// The entity type has no relation with this name.
    #[error("unknown relation '{relation}' on entity {entity}")]
    UnknownRelation { entity: String, relation: String },

    /// Metadata registered for a type that is already in use differs from
    /// what was registered before.
    #[error("conflicting metadata for entity {0}: the type is already in use")]
    ConflictingMetadata(String),

    /// Metadata is internally inconsistent.
    #[error("invalid metadata for entity {entity}: {reason}")]
    InvalidMetadata { entity: String, reason: String },

    /// A value or argument does not fit the entity's declared shape.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The instance is no longer tracked by this session.
    #[error("{entity} {key} is not managed by this session")]
    DetachedEntity { entity: String, key: PrimaryKey },

    /// The session has been closed.
    #[error("session is closed")]
    SessionClosed,

    /// The backend rejected a write, or the change set cannot be ordered.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// No row exists for the requested key.
    #[error("{entity} {key} not found")]
    NotFound { entity: String, key: PrimaryKey },

    /// Opaque failure reported by the storage backend.
    #[error("backend error: {0}")]
    Backend(String),

    /// A flush was cut off mid-batch; the session state is unknown.
    #[error("flush interrupted: session state is unknown, open a new session")]
    FlushInterrupted,

    /// Cascading a removal went deeper than the configured limit.
    #[error("cascade depth {depth} exceeded")]
    CascadeDepthExceeded { depth: usize },

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ormkit_proto::Error),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
}

impl Error {
    pub(crate) fn unknown_field(entity: &str, field: &str) -> Self {
        Error::UnknownField {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn unknown_relation(entity: &str, relation: &str) -> Self {
        Error::UnknownRelation {
            entity: entity.to_string(),
            relation: relation.to_string(),
        }
    }

    pub(crate) fn invalid_metadata(entity: &str, reason: impl Into<String>) -> Self {
        Error::InvalidMetadata {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}
