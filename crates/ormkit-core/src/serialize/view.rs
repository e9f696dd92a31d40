//! What a relation serializer override sees.

use super::json::key_to_json;
use crate::session::{Entity, Reference};
use ormkit_proto::{PrimaryKey, Value};

/// One related row as seen by a relation serializer.
///
/// The key is always available; the instance only when it is already
/// resolved. Nothing here performs I/O.
#[derive(Debug, Clone)]
pub struct RelatedRef {
    reference: Reference,
    /// Flattened key column names of the target entity.
    columns: Vec<String>,
}

impl RelatedRef {
    pub(crate) fn new(reference: Reference, columns: Vec<String>) -> Self {
        Self { reference, columns }
    }

    /// The underlying reference.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Target entity type.
    pub fn entity_name(&self) -> &str {
        self.reference.entity_name()
    }

    /// Target primary key.
    pub fn key(&self) -> &PrimaryKey {
        self.reference.key()
    }

    /// Value of one key column, by column name.
    pub fn key_component(&self, column: &str) -> Option<Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.reference.key().components().get(index).map(Value::from)
    }

    /// The key as JSON: scalar for a single column, array otherwise.
    pub fn key_json(&self) -> serde_json::Value {
        key_to_json(self.reference.key())
    }

    /// The resolved instance, if any.
    pub fn entity(&self) -> Option<Entity> {
        self.reference.get()
    }

    /// A field of the resolved instance, or a key column when the instance
    /// is not resolved.
    pub fn get(&self, field: &str) -> Option<Value> {
        match self.entity() {
            Some(entity) => entity.get(field).ok(),
            None => self.key_component(field),
        }
    }
}

/// State of a relation handed to a relation serializer.
#[derive(Debug, Clone)]
pub enum RelationView {
    /// A to-one relation; `None` when empty.
    One(Option<RelatedRef>),
    /// A to-many relation's known members.
    Many(Vec<RelatedRef>),
}

impl RelationView {
    /// The referenced row of a non-empty to-one relation.
    pub fn one(&self) -> Option<&RelatedRef> {
        match self {
            RelationView::One(related) => related.as_ref(),
            RelationView::Many(_) => None,
        }
    }

    /// Members of a to-many relation; empty for a to-one relation.
    pub fn many(&self) -> &[RelatedRef] {
        match self {
            RelationView::One(_) => &[],
            RelationView::Many(members) => members,
        }
    }
}
