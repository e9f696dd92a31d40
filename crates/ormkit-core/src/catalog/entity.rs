//! Entity metadata.

use super::field::FieldMetadata;
use super::relation::RelationMetadata;

/// Declared shape of an entity's primary key: component names in order.
///
/// Each component names either a scalar field or a to-one relation whose
/// target key is embedded in this key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyShape(pub Vec<String>);

impl PrimaryKeyShape {
    /// Component names in declared order.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Check if a name is part of the key.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|c| c == name)
    }

    /// Check if the key has more than one component.
    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }
}

/// One resolved primary-key component.
#[derive(Debug, Clone, Copy)]
pub enum KeyComponent<'a> {
    /// A scalar field.
    Field(&'a FieldMetadata),
    /// A to-one relation; contributes the target's key columns.
    Reference(&'a RelationMetadata),
}

/// Static description of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    /// Entity type name (unique within a registry).
    pub name: String,
    /// Scalar fields in declared order.
    pub fields: Vec<FieldMetadata>,
    /// Primary key shape.
    pub primary_key: PrimaryKeyShape,
    /// Relations in declared order.
    pub relations: Vec<RelationMetadata>,
}

impl EntityMetadata {
    /// Create entity metadata keyed by a single component.
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            primary_key: PrimaryKeyShape(vec![key_field.into()]),
            relations: Vec::new(),
        }
    }

    /// Replace the primary key with an ordered list of components.
    pub fn with_primary_key<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = PrimaryKeyShape(components.into_iter().map(Into::into).collect());
        self
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldMetadata) -> Self {
        self.fields.push(field);
        self
    }

    /// Add multiple fields.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldMetadata>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Add a relation.
    pub fn with_relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    /// Get a field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a field in declared order.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Get a relation by name.
    pub fn get_relation(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// To-one relations in declared order.
    pub fn to_one_relations(&self) -> impl Iterator<Item = &RelationMetadata> {
        self.relations.iter().filter(|r| r.is_to_one())
    }

    /// To-many relations in declared order.
    pub fn to_many_relations(&self) -> impl Iterator<Item = &RelationMetadata> {
        self.relations.iter().filter(|r| r.is_to_many())
    }

    /// Resolve a primary-key component name.
    pub fn key_component(&self, name: &str) -> Option<KeyComponent<'_>> {
        if let Some(field) = self.get_field(name) {
            return Some(KeyComponent::Field(field));
        }
        self.get_relation(name)
            .filter(|r| r.is_to_one())
            .map(KeyComponent::Reference)
    }

    /// Check if a field or relation is part of the primary key.
    pub fn is_key_component(&self, name: &str) -> bool {
        self.primary_key.contains(name)
    }

    /// The to-many relation on this entity that is the inverse of
    /// `source.relation`.
    pub fn inverse_collection(&self, source: &str, relation: &str) -> Option<&RelationMetadata> {
        self.to_many_relations()
            .find(|r| r.target == source && r.mapped_by.as_deref() == Some(relation))
    }

    /// Check the entity's own shape; cross-entity checks live in the registry.
    pub(crate) fn check_shape(&self) -> Result<(), crate::Error> {
        let entity = self.name.as_str();
        if self.primary_key.components().is_empty() {
            return Err(crate::Error::invalid_metadata(entity, "primary key has no components"));
        }

        let mut names = std::collections::HashSet::new();
        let all_names = self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.relations.iter().map(|r| r.name.as_str()));
        for name in all_names {
            if !names.insert(name) {
                return Err(crate::Error::invalid_metadata(
                    entity,
                    format!("'{}' is declared more than once", name),
                ));
            }
        }

        for component in self.primary_key.components() {
            match self.key_component(component) {
                Some(KeyComponent::Field(field)) => {
                    if field.nullable || !field.scalar.is_keyable() {
                        return Err(crate::Error::invalid_metadata(
                            entity,
                            format!("key field '{}' must be non-null and keyable", component),
                        ));
                    }
                }
                Some(KeyComponent::Reference(relation)) => {
                    if relation.nullable {
                        return Err(crate::Error::invalid_metadata(
                            entity,
                            format!("key reference '{}' must not be nullable", component),
                        ));
                    }
                }
                None => {
                    return Err(crate::Error::invalid_metadata(
                        entity,
                        format!("key component '{}' is not a field or to-one relation", component),
                    ));
                }
            }
        }

        for relation in &self.relations {
            match relation.kind {
                super::RelationKind::ToOne => {
                    if relation.mapped_by.is_some() {
                        return Err(crate::Error::invalid_metadata(
                            entity,
                            format!("to-one relation '{}' cannot be mapped_by", relation.name),
                        ));
                    }
                    if relation.on_delete == super::DeleteBehavior::SetNull
                        && (!relation.nullable || self.is_key_component(&relation.name))
                    {
                        return Err(crate::Error::invalid_metadata(
                            entity,
                            format!("set-null relation '{}' must be nullable", relation.name),
                        ));
                    }
                }
                super::RelationKind::ToMany => {
                    if relation.mapped_by.is_none() {
                        return Err(crate::Error::invalid_metadata(
                            entity,
                            format!("to-many relation '{}' needs mapped_by", relation.name),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
