//! Entity graph to JSON.

use super::json::{key_to_json, value_to_json};
use super::view::{RelatedRef, RelationView};
use crate::catalog::{MetadataRegistry, RelationMetadata};
use crate::error::Error;
use crate::session::{Entity, Reference, UnitOfWork};
use ormkit_proto::PrimaryKey;
use serde_json::{Map, Value as Json};

/// Options for `to_object`.
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    /// Relation paths to load before serializing, dotted for nested
    /// relations. Relations not listed are serialized as they are.
    pub populate: Vec<String>,
    /// Field or relation paths to leave out (`title`, `chapters.title`).
    pub exclude: Vec<String>,
    /// Leave out null fields and empty to-one relations.
    pub skip_null: bool,
}

impl SerializeOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relation path to load first.
    pub fn populate(mut self, path: impl Into<String>) -> Self {
        self.populate.push(path.into());
        self
    }

    /// Add a path to leave out.
    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.exclude.push(path.into());
        self
    }

    /// Leave out nulls.
    pub fn skip_null(mut self) -> Self {
        self.skip_null = true;
        self
    }
}

/// Serialize an entity to a JSON value tree.
///
/// Only the `populate` paths are loaded; everything else is emitted in its
/// current state. Populating requires the entity to be managed by `uow`.
pub fn to_object(uow: &mut UnitOfWork, entity: &Entity, options: &SerializeOptions) -> Result<Json, Error> {
    for path in &options.populate {
        uow.populate(entity, path)?;
    }
    let writer = Writer {
        registry: uow.registry().as_ref(),
        options,
    };
    let mut path = Vec::new();
    writer.entity(entity, "", &mut path)
}

struct Writer<'a> {
    registry: &'a MetadataRegistry,
    options: &'a SerializeOptions,
}

impl Writer<'_> {
    fn excluded(&self, prefix: &str, name: &str) -> bool {
        self.options
            .exclude
            .iter()
            .any(|e| e.strip_prefix(prefix).is_some_and(|rest| rest == name))
    }

    /// `path` holds the instances on the way from the root; an instance
    /// met again is written as its key.
    fn entity(&self, entity: &Entity, prefix: &str, path: &mut Vec<(String, PrimaryKey)>) -> Result<Json, Error> {
        let meta = entity.metadata();
        path.push((meta.name.clone(), entity.key()));

        let mut object = Map::new();
        for field in &meta.fields {
            if field.hidden || self.excluded(prefix, &field.name) {
                continue;
            }
            let value = entity.get(&field.name)?;
            if self.options.skip_null && value.is_null() {
                continue;
            }
            let json = match &field.serializer {
                Some(serializer) => serializer.apply(&value),
                None => value_to_json(&value),
            };
            object.insert(field.name.clone(), json);
        }

        for relation in &meta.relations {
            if relation.hidden || self.excluded(prefix, &relation.name) {
                continue;
            }
            let nested = format!("{}{}.", prefix, relation.name);
            let json = if relation.is_to_one() {
                self.to_one(entity, relation, &nested, path)?
            } else {
                self.to_many(entity, relation, &nested, path)?
            };
            if let Some(json) = json {
                object.insert(relation.name.clone(), json);
            }
        }

        path.pop();
        Ok(Json::Object(object))
    }

    fn to_one(
        &self,
        entity: &Entity,
        relation: &RelationMetadata,
        prefix: &str,
        path: &mut Vec<(String, PrimaryKey)>,
    ) -> Result<Option<Json>, Error> {
        let reference = entity.reference(&relation.name)?;
        if let Some(serializer) = &relation.serializer {
            let related = match reference {
                Some(reference) => Some(self.related(reference)?),
                None => None,
            };
            return Ok(Some(serializer.apply(&RelationView::One(related))));
        }

        match reference {
            None if self.options.skip_null => Ok(None),
            None => Ok(Some(Json::Null)),
            Some(reference) => self.member(&reference, prefix, path).map(Some),
        }
    }

    fn to_many(
        &self,
        entity: &Entity,
        relation: &RelationMetadata,
        prefix: &str,
        path: &mut Vec<(String, PrimaryKey)>,
    ) -> Result<Option<Json>, Error> {
        let collection = entity.collection(&relation.name)?;
        if let Some(serializer) = &relation.serializer {
            let members = collection
                .items()
                .into_iter()
                .map(|r| self.related(r))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Some(serializer.apply(&RelationView::Many(members))));
        }

        // An unloaded collection has no complete member list to emit.
        if !collection.is_loaded() {
            return Ok(None);
        }
        let members = collection
            .items()
            .iter()
            .map(|r| self.member(r, prefix, path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Json::Array(members)))
    }

    /// A related row: nested when resolved and not already on the path,
    /// its key otherwise.
    fn member(&self, reference: &Reference, prefix: &str, path: &mut Vec<(String, PrimaryKey)>) -> Result<Json, Error> {
        let on_path = path
            .iter()
            .any(|(e, k)| e == reference.entity_name() && k == reference.key());
        match reference.get() {
            Some(target) if !on_path => self.entity(&target, prefix, path),
            _ => Ok(key_to_json(reference.key())),
        }
    }

    fn related(&self, reference: Reference) -> Result<RelatedRef, Error> {
        let columns = self.registry.key_columns(reference.entity_name())?;
        Ok(RelatedRef::new(reference, columns))
    }
}
