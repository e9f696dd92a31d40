//! Identity map: one live instance per (entity type, primary key).

use super::entity::Entity;
use crate::error::Error;
use ormkit_proto::PrimaryKey;
use std::collections::HashMap;

/// Session-scoped cache of managed instances.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<String, HashMap<PrimaryKey, Entity>>,
    /// Registration order, for deterministic iteration.
    order: Vec<(String, PrimaryKey)>,
}

impl IdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the managed instance for a key.
    pub fn get(&self, entity: &str, key: &PrimaryKey) -> Option<Entity> {
        self.entries.get(entity).and_then(|m| m.get(key)).cloned()
    }

    /// Return the managed instance for a key, building and registering one
    /// with `factory` if there is none.
    pub fn get_or_create<F>(&mut self, entity: &str, key: &PrimaryKey, factory: F) -> Result<Entity, Error>
    where
        F: FnOnce() -> Result<Entity, Error>,
    {
        if let Some(existing) = self.get(entity, key) {
            return Ok(existing);
        }
        let instance = factory()?;
        self.insert(instance.clone())?;
        Ok(instance)
    }

    /// Register an instance. Registering a different instance under a key
    /// that is already taken fails.
    pub fn insert(&mut self, instance: Entity) -> Result<(), Error> {
        let entity = instance.entity_name();
        let key = instance.key();
        let slot = self.entries.entry(entity.clone()).or_default();
        match slot.get(&key) {
            Some(existing) if existing.same_instance(&instance) => Ok(()),
            Some(_) => Err(Error::InvalidData(format!(
                "another {} instance with key {} is already managed",
                entity, key
            ))),
            None => {
                slot.insert(key.clone(), instance);
                self.order.push((entity, key));
                Ok(())
            }
        }
    }

    /// Detach the instance registered under a key.
    pub fn remove(&mut self, entity: &str, key: &PrimaryKey) -> Option<Entity> {
        let removed = self.entries.get_mut(entity).and_then(|m| m.remove(key));
        if removed.is_some() {
            self.order.retain(|(e, k)| !(e == entity && k == key));
        }
        removed
    }

    /// Check if this exact instance is managed.
    pub fn contains(&self, instance: &Entity) -> bool {
        self.get(&instance.entity_name(), &instance.key())
            .is_some_and(|managed| managed.same_instance(instance))
    }

    /// Check if any instance is registered under a key.
    pub fn contains_key(&self, entity: &str, key: &PrimaryKey) -> bool {
        self.entries.get(entity).is_some_and(|m| m.contains_key(key))
    }

    /// Detach every instance.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of managed instances.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if nothing is managed.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Managed instances in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.order
            .iter()
            .filter_map(|(entity, key)| self.entries.get(entity).and_then(|m| m.get(key)))
    }

    /// Managed instances of one type, in registration order.
    pub fn of_type<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.order
            .iter()
            .filter(move |(e, _)| e == entity)
            .filter_map(|(entity, key)| self.entries.get(entity).and_then(|m| m.get(key)))
    }
}
