//! Entity instances tracked by a session.
//!
//! An [`Entity`] is a shared handle to one in-memory instance. Cloning the
//! handle never copies the instance: every clone observes the same state,
//! and two handles are equal only when they point at the same instance.

use super::collection::Collection;
use super::reference::Reference;
use crate::catalog::{EntityMetadata, MetadataRegistry};
use crate::error::Error;
use ormkit_proto::{PrimaryKey, Row, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Mutable state behind an entity handle.
pub(crate) struct EntityState {
    pub(crate) meta: Arc<EntityMetadata>,
    pub(crate) key: PrimaryKey,
    /// Field values aligned with `meta.fields`.
    pub(crate) values: Vec<Value>,
    /// To-one references by relation name.
    pub(crate) references: HashMap<String, Option<Reference>>,
    /// To-many collections by relation name.
    pub(crate) collections: HashMap<String, Collection>,
    /// Last row known to be in storage; `None` until the first insert.
    pub(crate) snapshot: Option<Row>,
    pub(crate) removed: bool,
}

/// Handle to a managed (or formerly managed) entity instance.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<RwLock<EntityState>>,
}

/// Non-owning handle to an entity instance.
#[derive(Clone)]
pub struct WeakEntity(Weak<RwLock<EntityState>>);

impl WeakEntity {
    /// Upgrade to a strong handle if the instance is still alive.
    pub fn upgrade(&self) -> Option<Entity> {
        self.0.upgrade().map(|inner| Entity { inner })
    }
}

impl fmt::Debug for WeakEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakEntity(..)")
    }
}

impl Entity {
    /// Build an instance. Collections of a new instance start loaded (there
    /// is nothing to fetch); collections of a persisted one start unloaded.
    pub(crate) fn build(
        meta: Arc<EntityMetadata>,
        key: PrimaryKey,
        values: Vec<Value>,
        references: HashMap<String, Option<Reference>>,
        persisted: bool,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let owner = Reference::resolved(
                meta.name.clone(),
                key.clone(),
                WeakEntity(weak.clone()),
            );
            let collections = meta
                .to_many_relations()
                .map(|r| (r.name.clone(), Collection::new(owner.clone(), r, !persisted)))
                .collect();
            RwLock::new(EntityState {
                meta,
                key,
                values,
                references,
                collections,
                snapshot: persisted.then(Row::new),
                removed: false,
            })
        });
        Self { inner }
    }

    /// Entity type name.
    pub fn entity_name(&self) -> String {
        self.inner.read().meta.name.clone()
    }

    /// Entity metadata.
    pub fn metadata(&self) -> Arc<EntityMetadata> {
        Arc::clone(&self.inner.read().meta)
    }

    /// Primary key.
    pub fn key(&self) -> PrimaryKey {
        self.inner.read().key.clone()
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Result<Value, Error> {
        let state = self.inner.read();
        state
            .meta
            .field_index(field)
            .map(|i| state.values[i].clone())
            .ok_or_else(|| Error::unknown_field(&state.meta.name, field))
    }

    /// Set a field value. Primary-key fields cannot change.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<(), Error> {
        let mut state = self.inner.write();
        let index = state
            .meta
            .field_index(field)
            .ok_or_else(|| Error::unknown_field(&state.meta.name, field))?;
        if state.meta.is_key_component(field) {
            return Err(Error::InvalidData(format!(
                "{}.{} is part of the primary key and cannot change",
                state.meta.name, field
            )));
        }
        let value = state.meta.fields[index].accept(&state.meta.name, value.into())?;
        state.values[index] = value;
        Ok(())
    }

    /// Current value of a to-one relation.
    pub fn reference(&self, relation: &str) -> Result<Option<Reference>, Error> {
        let state = self.inner.read();
        state
            .references
            .get(relation)
            .cloned()
            .ok_or_else(|| Error::unknown_relation(&state.meta.name, relation))
    }

    /// Point a to-one relation at another entity, or clear it.
    ///
    /// Loaded inverse collections on the previous and the new target are
    /// updated to match.
    pub fn set_reference(&self, relation: &str, target: Option<Reference>) -> Result<(), Error> {
        let previous = self.assign_reference(relation, target.clone())?;
        if previous == target {
            return Ok(());
        }

        let name = self.entity_name();
        let own = Reference::from(self);
        if let Some(previous) = previous.as_ref().and_then(Reference::get) {
            if let Some(collection) = previous.inverse_collection(&name, relation) {
                collection.detach_member(own.key());
            }
        }
        if let Some(next) = target.as_ref().and_then(Reference::get) {
            if let Some(collection) = next.inverse_collection(&name, relation) {
                collection.attach_member(own);
            }
        }
        Ok(())
    }

    /// A to-many relation's collection.
    pub fn collection(&self, relation: &str) -> Result<Collection, Error> {
        let state = self.inner.read();
        state
            .collections
            .get(relation)
            .cloned()
            .ok_or_else(|| Error::unknown_relation(&state.meta.name, relation))
    }

    /// True until the instance has been inserted by a flush.
    pub fn is_new(&self) -> bool {
        self.inner.read().snapshot.is_none()
    }

    /// True once the instance was deleted by a flush, or discarded before
    /// it was ever inserted.
    pub fn is_removed(&self) -> bool {
        self.inner.read().removed
    }

    /// Non-owning handle to this instance.
    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity(Arc::downgrade(&self.inner))
    }

    /// Check if two handles point at the same instance.
    pub fn same_instance(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Replace a to-one reference without touching inverse collections.
    /// Returns the previous value.
    pub(crate) fn assign_reference(
        &self,
        relation: &str,
        target: Option<Reference>,
    ) -> Result<Option<Reference>, Error> {
        let mut state = self.inner.write();
        let meta = Arc::clone(&state.meta);
        let declared = meta
            .get_relation(relation)
            .filter(|r| r.is_to_one())
            .ok_or_else(|| Error::unknown_relation(&meta.name, relation))?;

        if meta.is_key_component(relation) {
            return Err(Error::InvalidData(format!(
                "{}.{} is part of the primary key and cannot change",
                meta.name, relation
            )));
        }
        match &target {
            None if !declared.nullable => {
                return Err(Error::InvalidData(format!(
                    "{}.{} is required",
                    meta.name, relation
                )));
            }
            Some(r) if r.entity_name() != declared.target => {
                return Err(Error::InvalidData(format!(
                    "{}.{} expects {}, got {}",
                    meta.name,
                    relation,
                    declared.target,
                    r.entity_name()
                )));
            }
            _ => {}
        }

        Ok(state.references.insert(relation.to_string(), target).flatten())
    }

    /// Cache a loaded target on a to-one reference whose key matches it.
    pub(crate) fn resolve_reference(&self, relation: &str, target: &Entity) {
        let target_key = target.key();
        let mut state = self.inner.write();
        if let Some(Some(reference)) = state.references.get_mut(relation) {
            if reference.key() == &target_key {
                reference.attach(target);
            }
        }
    }

    /// The collection on this instance that is the inverse of
    /// `source.relation`, if one is declared.
    pub(crate) fn inverse_collection(&self, source: &str, relation: &str) -> Option<Collection> {
        let state = self.inner.read();
        state
            .meta
            .inverse_collection(source, relation)
            .and_then(|r| state.collections.get(&r.name).cloned())
    }

    /// All to-one references in declared order.
    pub(crate) fn references(&self) -> Vec<(String, Option<Reference>)> {
        let state = self.inner.read();
        state
            .meta
            .to_one_relations()
            .map(|r| (r.name.clone(), state.references.get(&r.name).cloned().flatten()))
            .collect()
    }

    /// Column values as stored: fields followed by join columns.
    pub(crate) fn row(&self, registry: &MetadataRegistry) -> Result<Row, Error> {
        let state = self.inner.read();
        let mut row = Row::new();
        for (field, value) in state.meta.fields.iter().zip(&state.values) {
            row.set(field.name.clone(), value.clone());
        }

        for relation in state.meta.to_one_relations() {
            let columns = registry.join_columns(&state.meta, relation)?;
            match state.references.get(&relation.name).cloned().flatten() {
                Some(target) => {
                    if target.key().len() != columns.len() {
                        return Err(Error::InvalidData(format!(
                            "{}.{} key has {} components, expected {}",
                            state.meta.name,
                            relation.name,
                            target.key().len(),
                            columns.len()
                        )));
                    }
                    for (column, value) in columns.into_iter().zip(target.key().values()) {
                        row.set(column, value);
                    }
                }
                None => {
                    for column in columns {
                        row.set(column, Value::Null);
                    }
                }
            }
        }
        Ok(row)
    }

    pub(crate) fn snapshot(&self) -> Option<Row> {
        self.inner.read().snapshot.clone()
    }

    pub(crate) fn mark_persisted(&self, row: Row) {
        self.inner.write().snapshot = Some(row);
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.write().removed = true;
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Some(state) => f
                .debug_struct("Entity")
                .field("entity", &state.meta.name)
                .field("key", &state.key)
                .field("new", &state.snapshot.is_none())
                .field("removed", &state.removed)
                .finish(),
            None => f.write_str("Entity(<locked>)"),
        }
    }
}

/// Input for creating an entity: field values and to-one references.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    pub(crate) values: Vec<(String, Value)>,
    pub(crate) references: Vec<(String, Option<Reference>)>,
}

impl EntityData {
    /// Create empty creation data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field value.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((field.into(), value.into()));
        self
    }

    /// Point a to-one relation at an entity or a bare key.
    pub fn reference(mut self, relation: impl Into<String>, target: impl Into<Reference>) -> Self {
        self.references.push((relation.into(), Some(target.into())));
        self
    }

    /// Leave a nullable to-one relation empty.
    pub fn null_reference(mut self, relation: impl Into<String>) -> Self {
        self.references.push((relation.into(), None));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldMetadata, RelationMetadata, ScalarType};

    fn registry() -> MetadataRegistry {
        MetadataRegistry::new()
            .with_entity(
                EntityMetadata::new("Author", "id")
                    .with_field(FieldMetadata::new("id", ScalarType::Int32))
                    .with_field(FieldMetadata::new("name", ScalarType::String))
                    .with_relation(RelationMetadata::to_many("posts", "Post", "author")),
            )
            .unwrap()
            .with_entity(
                EntityMetadata::new("Post", "id")
                    .with_field(FieldMetadata::new("id", ScalarType::Int64))
                    .with_relation(RelationMetadata::to_one("author", "Author").nullable()),
            )
            .unwrap()
    }

    fn author(registry: &MetadataRegistry, id: i32) -> Entity {
        Entity::build(
            registry.get("Author").unwrap(),
            PrimaryKey::single(id),
            vec![Value::Int32(id), Value::String("Ann".into())],
            HashMap::new(),
            false,
        )
    }

    fn post(registry: &MetadataRegistry, id: i64) -> Entity {
        let mut references = HashMap::new();
        references.insert("author".to_string(), None);
        Entity::build(
            registry.get("Post").unwrap(),
            PrimaryKey::single(id),
            vec![Value::Int64(id)],
            references,
            false,
        )
    }

    #[test]
    fn test_get_and_set() {
        let registry = registry();
        let author = author(&registry, 1);

        assert_eq!(author.get("name").unwrap(), Value::String("Ann".into()));
        author.set("name", "Bea").unwrap();
        assert_eq!(author.get("name").unwrap(), Value::String("Bea".into()));

        assert!(matches!(author.get("missing"), Err(Error::UnknownField { .. })));
        assert!(matches!(author.set("id", 2i32), Err(Error::InvalidData(_))));
        assert!(matches!(author.set("name", 5i32), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_handles_share_state() {
        let registry = registry();
        let a = author(&registry, 1);
        let b = a.clone();
        b.set("name", "Cy").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.get("name").unwrap(), Value::String("Cy".into()));
        assert_ne!(a, author(&registry, 1));
    }

    #[test]
    fn test_set_reference_updates_inverse_collection() {
        let registry = registry();
        let ann = author(&registry, 1);
        let bob = author(&registry, 2);
        let post = post(&registry, 10);

        post.set_reference("author", Some(Reference::from(&ann))).unwrap();
        assert!(ann.collection("posts").unwrap().contains(&post));

        post.set_reference("author", Some(Reference::from(&bob))).unwrap();
        assert!(!ann.collection("posts").unwrap().contains(&post));
        assert!(bob.collection("posts").unwrap().contains(&post));

        post.set_reference("author", None).unwrap();
        assert!(bob.collection("posts").unwrap().is_empty());
    }

    #[test]
    fn test_set_reference_checks_target_type() {
        let registry = registry();
        let post = post(&registry, 10);
        let other = Reference::from_key("Post", PrimaryKey::single(11i64));
        assert!(matches!(
            post.set_reference("author", Some(other)),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_row_includes_join_columns() {
        let registry = registry();
        let ann = author(&registry, 1);
        let post = post(&registry, 10);

        let row = post.row(&registry).unwrap();
        assert_eq!(row.get("author_id"), Some(&Value::Null));

        post.set_reference("author", Some(Reference::from(&ann))).unwrap();
        let row = post.row(&registry).unwrap();
        assert_eq!(row.get("id"), Some(&Value::Int64(10)));
        assert_eq!(row.get("author_id"), Some(&Value::Int32(1)));
    }
}
