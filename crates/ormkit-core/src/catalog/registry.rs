//! Metadata registry: the static description of every entity type.
//!
//! Metadata is registered once at startup. The first lookup of a type
//! freezes it; registering different metadata afterwards is a fatal
//! configuration error.

use super::entity::{EntityMetadata, KeyComponent};
use super::relation::{DeleteBehavior, RelationMetadata};
use super::types::ScalarType;
use crate::error::Error;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum nesting of references inside primary keys.
const MAX_KEY_NESTING: usize = 16;

/// Registry of entity metadata.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    /// Metadata keyed by entity name.
    entities: RwLock<HashMap<String, Arc<EntityMetadata>>>,
    /// Types that have been looked up at least once.
    queried: RwLock<HashSet<String>>,
}

impl MetadataRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register metadata for an entity type.
    ///
    /// Registering identical metadata again is a no-op. Different metadata
    /// replaces the previous registration only while the type has never
    /// been looked up.
    pub fn register(&self, metadata: EntityMetadata) -> Result<(), Error> {
        metadata.check_shape()?;

        let mut entities = self.entities.write();
        if let Some(existing) = entities.get(&metadata.name) {
            if **existing == metadata {
                return Ok(());
            }
            if self.queried.read().contains(&metadata.name) {
                return Err(Error::ConflictingMetadata(metadata.name));
            }
            warn!(entity = %metadata.name, "replacing metadata registered earlier");
        }

        debug!(
            entity = %metadata.name,
            fields = metadata.fields.len(),
            relations = metadata.relations.len(),
            "registered entity metadata"
        );
        entities.insert(metadata.name.clone(), Arc::new(metadata));
        Ok(())
    }

    /// Builder-style registration.
    pub fn with_entity(self, metadata: EntityMetadata) -> Result<Self, Error> {
        self.register(metadata)?;
        Ok(self)
    }

    /// Get metadata for an entity type.
    pub fn get(&self, name: &str) -> Result<Arc<EntityMetadata>, Error> {
        let metadata = self
            .entities
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))?;

        if !self.queried.read().contains(name) {
            self.queried.write().insert(name.to_string());
        }
        Ok(metadata)
    }

    /// Check if an entity type is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entities.read().contains_key(name)
    }

    /// Registered entity names, sorted.
    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Check cross-entity consistency: relation targets exist, to-many
    /// relations have a matching inverse, key and join columns resolve.
    pub fn validate(&self) -> Result<(), Error> {
        let all: Vec<Arc<EntityMetadata>> = self.entities.read().values().cloned().collect();

        for entity in &all {
            for relation in &entity.relations {
                let target = self.get(&relation.target)?;

                if let Some(mapped_by) = &relation.mapped_by {
                    let inverse = target
                        .get_relation(mapped_by)
                        .filter(|r| r.is_to_one() && r.target == entity.name);
                    let Some(inverse) = inverse else {
                        return Err(Error::invalid_metadata(
                            &entity.name,
                            format!(
                                "'{}' is mapped by {}.{}, which is not a to-one relation back to {}",
                                relation.name, target.name, mapped_by, entity.name
                            ),
                        ));
                    };
                    let clearable = inverse.nullable && !target.is_key_component(&inverse.name);
                    if relation.on_delete == DeleteBehavior::SetNull && !clearable {
                        return Err(Error::invalid_metadata(
                            &entity.name,
                            format!(
                                "set-null collection '{}' needs {}.{} to be nullable",
                                relation.name, target.name, mapped_by
                            ),
                        ));
                    }
                }
            }

            let mut columns: HashSet<String> =
                entity.fields.iter().map(|f| f.name.clone()).collect();
            for relation in entity.to_one_relations() {
                for column in self.join_columns(entity, relation)? {
                    if !columns.insert(column.clone()) {
                        return Err(Error::invalid_metadata(
                            &entity.name,
                            format!("column '{}' of relation '{}' is already used", column, relation.name),
                        ));
                    }
                }
            }
            self.key_columns(&entity.name)?;
        }
        Ok(())
    }

    /// Flattened key column names of an entity, in key order.
    ///
    /// A scalar component contributes its field name; a reference component
    /// contributes the relation's join columns.
    pub fn key_columns(&self, entity: &str) -> Result<Vec<String>, Error> {
        self.key_columns_nested(entity, 0)
    }

    fn key_columns_nested(&self, entity: &str, depth: usize) -> Result<Vec<String>, Error> {
        if depth > MAX_KEY_NESTING {
            return Err(Error::invalid_metadata(entity, "primary key references form a cycle"));
        }
        let metadata = self.get(entity)?;
        let mut columns = Vec::new();
        for component in metadata.primary_key.components() {
            match metadata.key_component(component) {
                Some(KeyComponent::Field(field)) => columns.push(field.name.clone()),
                Some(KeyComponent::Reference(relation)) => {
                    columns.extend(self.join_columns_nested(&metadata, relation, depth + 1)?)
                }
                None => return Err(Error::unknown_field(entity, component)),
            }
        }
        Ok(columns)
    }

    /// Scalar types of the flattened key columns, aligned with
    /// [`key_columns`](Self::key_columns).
    pub fn key_types(&self, entity: &str) -> Result<Vec<ScalarType>, Error> {
        self.key_types_nested(entity, 0)
    }

    fn key_types_nested(&self, entity: &str, depth: usize) -> Result<Vec<ScalarType>, Error> {
        if depth > MAX_KEY_NESTING {
            return Err(Error::invalid_metadata(entity, "primary key references form a cycle"));
        }
        let metadata = self.get(entity)?;
        let mut types = Vec::new();
        for component in metadata.primary_key.components() {
            match metadata.key_component(component) {
                Some(KeyComponent::Field(field)) => types.push(field.scalar),
                Some(KeyComponent::Reference(relation)) => {
                    types.extend(self.key_types_nested(&relation.target, depth + 1)?)
                }
                None => return Err(Error::unknown_field(entity, component)),
            }
        }
        Ok(types)
    }

    /// Foreign-key column names a to-one relation occupies on its entity.
    pub fn join_columns(
        &self,
        entity: &EntityMetadata,
        relation: &RelationMetadata,
    ) -> Result<Vec<String>, Error> {
        self.join_columns_nested(entity, relation, 0)
    }

    fn join_columns_nested(
        &self,
        entity: &EntityMetadata,
        relation: &RelationMetadata,
        depth: usize,
    ) -> Result<Vec<String>, Error> {
        if !relation.is_to_one() {
            return Err(Error::invalid_metadata(
                &entity.name,
                format!("'{}' is not a to-one relation", relation.name),
            ));
        }
        let target_columns = self.key_columns_nested(&relation.target, depth)?;
        if relation.join_columns.is_empty() {
            return Ok(target_columns
                .iter()
                .map(|c| format!("{}_{}", relation.name, c))
                .collect());
        }
        if relation.join_columns.len() != target_columns.len() {
            return Err(Error::invalid_metadata(
                &entity.name,
                format!(
                    "relation '{}' declares {} join columns but {} has {} key columns",
                    relation.name,
                    relation.join_columns.len(),
                    relation.target,
                    target_columns.len()
                ),
            ));
        }
        Ok(relation.join_columns.clone())
    }

    /// To-one relations, on any entity, whose target is `entity`.
    pub fn relations_targeting(&self, entity: &str) -> Vec<(Arc<EntityMetadata>, RelationMetadata)> {
        let mut found: Vec<(Arc<EntityMetadata>, RelationMetadata)> = self
            .entities
            .read()
            .values()
            .flat_map(|source| {
                source
                    .to_one_relations()
                    .filter(|r| r.target == entity)
                    .map(|r| (Arc::clone(source), r.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by(|a, b| (&a.0.name, &a.1.name).cmp(&(&b.0.name, &b.1.name)));
        found
    }
}
