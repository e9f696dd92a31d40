//! Lazy, key-based handles to related entities.

use super::entity::{Entity, WeakEntity};
use super::unit_of_work::UnitOfWork;
use crate::error::Error;
use ormkit_proto::PrimaryKey;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A reference to one row of another entity type.
///
/// The key is always available. The instance is cached only weakly, so a
/// reference never keeps its target alive; equality and hashing look at
/// the entity type and key alone.
#[derive(Clone)]
pub struct Reference {
    entity: String,
    key: PrimaryKey,
    resolved: Option<WeakEntity>,
}

impl Reference {
    /// Create an unresolved reference from a bare key.
    pub fn from_key(entity: impl Into<String>, key: PrimaryKey) -> Self {
        Self {
            entity: entity.into(),
            key,
            resolved: None,
        }
    }

    pub(crate) fn resolved(entity: String, key: PrimaryKey, instance: WeakEntity) -> Self {
        Self {
            entity,
            key,
            resolved: Some(instance),
        }
    }

    /// Target entity type.
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    /// Target primary key. Never performs I/O.
    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    /// Check if the target instance is resolved and alive.
    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    /// The resolved instance, without I/O.
    pub fn get(&self) -> Option<Entity> {
        self.resolved.as_ref().and_then(WeakEntity::upgrade)
    }

    /// Resolve the target through the session, loading it from storage if
    /// needed, and cache the instance on this reference.
    pub fn load(&mut self, uow: &mut UnitOfWork) -> Result<Entity, Error> {
        uow.resolve_reference(self)
    }

    /// The same target under an equivalent key of the declared types.
    pub(crate) fn with_key(mut self, key: PrimaryKey) -> Self {
        self.key = key;
        self
    }

    pub(crate) fn attach(&mut self, instance: &Entity) {
        self.resolved = Some(instance.downgrade());
    }
}

impl From<&Entity> for Reference {
    fn from(instance: &Entity) -> Self {
        Self::resolved(instance.entity_name(), instance.key(), instance.downgrade())
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.key == other.key
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("entity", &self.entity)
            .field("key", &self.key)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
