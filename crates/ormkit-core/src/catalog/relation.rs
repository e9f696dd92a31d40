//! Relation metadata between entities.

use crate::serialize::RelationView;
use std::fmt;
use std::sync::Arc;

/// Kind of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Single reference to another entity (foreign key on this side).
    ToOne,
    /// Collection of entities that reference this one back.
    ToMany,
}

/// What happens to dependents when the entity they point at is removed.
///
/// On a to-one relation the policy applies to the owning entity when its
/// target is removed. On a to-many relation it applies to the collection
/// members when the collection's owner is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteBehavior {
    /// Leave dependents untouched; the backend may reject the delete.
    #[default]
    None,
    /// Clear the dependent's reference.
    SetNull,
    /// Remove dependents transitively.
    Cascade,
}

type RelationSerializeFn = dyn Fn(&RelationView) -> serde_json::Value + Send + Sync;

/// A user-supplied function that renders a relation in serialized output.
///
/// It receives the relation in its current state. Key-only access never
/// triggers I/O.
#[derive(Clone)]
pub struct RelationSerializer(Arc<RelationSerializeFn>);

impl RelationSerializer {
    /// Wrap a serializer function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RelationView) -> serde_json::Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Apply the serializer.
    pub fn apply(&self, view: &RelationView) -> serde_json::Value {
        (self.0)(view)
    }
}

impl fmt::Debug for RelationSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RelationSerializer(..)")
    }
}

// Same rule as field serializers: presence is compared, the function is not.
impl PartialEq for RelationSerializer {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// A relation declared on an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationMetadata {
    /// Relation name (unique within the entity, shared with fields).
    pub name: String,
    /// Relation kind.
    pub kind: RelationKind,
    /// Target entity type.
    pub target: String,
    /// Whether this side stores the foreign key.
    pub owner: bool,
    /// Delete policy.
    pub on_delete: DeleteBehavior,
    /// Whether a to-one reference may be empty.
    pub nullable: bool,
    /// Excluded from serialized output.
    pub hidden: bool,
    /// Foreign-key column names on this entity (to-one only). Empty means
    /// `<relation>_<target key column>` for every target key column.
    pub join_columns: Vec<String>,
    /// Name of the to-one relation on the target that points back (to-many only).
    pub mapped_by: Option<String>,
    /// Serializer override.
    pub serializer: Option<RelationSerializer>,
}

impl RelationMetadata {
    /// Create a required to-one relation.
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ToOne,
            target: target.into(),
            owner: true,
            on_delete: DeleteBehavior::None,
            nullable: false,
            hidden: false,
            join_columns: Vec::new(),
            mapped_by: None,
            serializer: None,
        }
    }

    /// Create a to-many relation, inverse of `mapped_by` on the target.
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ToMany,
            target: target.into(),
            owner: false,
            on_delete: DeleteBehavior::None,
            nullable: true,
            hidden: false,
            join_columns: Vec::new(),
            mapped_by: Some(mapped_by.into()),
            serializer: None,
        }
    }

    /// Allow an empty reference.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the delete policy.
    pub fn with_on_delete(mut self, on_delete: DeleteBehavior) -> Self {
        self.on_delete = on_delete;
        self
    }

    /// Override the foreign-key column names.
    pub fn with_join_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Hide the relation from serialized output.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Set a serializer override.
    pub fn with_serializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&RelationView) -> serde_json::Value + Send + Sync + 'static,
    {
        self.serializer = Some(RelationSerializer::new(f));
        self
    }

    /// Check if this is a to-one relation.
    pub fn is_to_one(&self) -> bool {
        self.kind == RelationKind::ToOne
    }

    /// Check if this is a to-many relation.
    pub fn is_to_many(&self) -> bool {
        self.kind == RelationKind::ToMany
    }
}
