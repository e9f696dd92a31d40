//! ormkit core - metadata registry, unit of work, and serializer.
//!
//! Entity types are described once in a [`MetadataRegistry`]. A
//! [`UnitOfWork`] tracks the instances of one logical session in an
//! identity map, stages creates, updates, and removals, and flushes them to
//! a [`StorageBackend`] as one ordered change batch. The serializer turns
//! instance graphs into JSON under per-field and per-relation overrides.

pub mod catalog;
pub mod error;
pub mod serialize;
pub mod session;
pub mod storage;

pub use catalog::{
    DefaultValue, DeleteBehavior, EntityMetadata, FieldMetadata, MetadataRegistry, RelationKind,
    RelationMetadata, ScalarType,
};
pub use error::Error;
pub use serialize::{to_object, RelatedRef, RelationView, SerializeOptions};
pub use session::{
    Collection, Entity, EntityData, FindOptions, PendingChange, Reference, SessionConfig,
    SessionState, StagedOp, UnitOfWork,
};
pub use storage::{BackendError, RelatedRequest, SledBackend, StorageBackend, StorageConfig};

/// Re-export protocol types.
pub use ormkit_proto as proto;
