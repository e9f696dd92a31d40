//! Entity metadata catalog.
//!
//! The catalog describes entity types: their fields, primary key shape,
//! relations, delete policies, and serialization overrides.

mod entity;
mod field;
mod registry;
mod relation;
mod types;

pub use entity::{EntityMetadata, KeyComponent, PrimaryKeyShape};
pub use field::{DefaultValue, FieldMetadata, FieldSerializer};
pub use registry::MetadataRegistry;
pub use relation::{DeleteBehavior, RelationKind, RelationMetadata, RelationSerializer};
pub use types::ScalarType;
