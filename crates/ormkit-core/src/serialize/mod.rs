//! Serializer: entity graphs to plain JSON value trees.
//!
//! Fields pass through their serializer override when one is configured,
//! otherwise the raw value is emitted. Relations are nested when resolved
//! and emitted as keys when not; relation overrides see a [`RelationView`]
//! and never trigger I/O.

mod json;
mod serializer;
mod view;

pub use json::{key_to_json, value_to_json};
pub use serializer::{to_object, SerializeOptions};
pub use view::{RelatedRef, RelationView};
