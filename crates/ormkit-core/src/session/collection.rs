//! To-many collections.
//!
//! A collection belongs to one owner instance and lists member references in
//! relation order. Adding or removing members is visible immediately and
//! keeps each member's back-reference in step; storage only changes when
//! the session flushes the members' rows.

use super::entity::Entity;
use super::reference::Reference;
use super::unit_of_work::UnitOfWork;
use crate::catalog::RelationMetadata;
use crate::error::Error;
use ormkit_proto::PrimaryKey;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

struct CollectionState {
    owner: Reference,
    relation: String,
    target: String,
    mapped_by: String,
    /// Known members: loaded rows plus local additions.
    items: Vec<Reference>,
    /// Members removed locally, hidden from rows fetched later.
    removed: Vec<Reference>,
    loaded: bool,
}

/// Handle to an owner's to-many relation.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<RwLock<CollectionState>>,
}

impl Collection {
    pub(crate) fn new(owner: Reference, relation: &RelationMetadata, loaded: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CollectionState {
                owner,
                relation: relation.name.clone(),
                target: relation.target.clone(),
                mapped_by: relation.mapped_by.clone().unwrap_or_default(),
                items: Vec::new(),
                removed: Vec::new(),
                loaded,
            })),
        }
    }

    /// Reference to the owning instance.
    pub fn owner(&self) -> Reference {
        self.inner.read().owner.clone()
    }

    /// Relation name on the owner.
    pub fn relation_name(&self) -> String {
        self.inner.read().relation.clone()
    }

    /// Member entity type.
    pub fn target(&self) -> String {
        self.inner.read().target.clone()
    }

    /// Check if the full member set has been fetched.
    pub fn is_loaded(&self) -> bool {
        self.inner.read().loaded
    }

    /// Number of known members.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Check if there are no known members.
    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    /// Known member references, in order. Never performs I/O.
    pub fn items(&self) -> Vec<Reference> {
        self.inner.read().items.clone()
    }

    /// Known members whose instances are alive. Never performs I/O.
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.read().items.iter().filter_map(Reference::get).collect()
    }

    /// Check if an instance is a known member.
    pub fn contains(&self, member: &Entity) -> bool {
        let reference = Reference::from(member);
        self.inner.read().items.contains(&reference)
    }

    /// Add members, pointing each member's back-reference at the owner.
    pub fn add(&self, members: &[&Entity]) -> Result<(), Error> {
        let (owner, target, relation, mapped_by) = {
            let state = self.inner.read();
            (
                state.owner.clone(),
                state.target.clone(),
                state.relation.clone(),
                state.mapped_by.clone(),
            )
        };

        for member in members {
            let name = member.entity_name();
            if name != target {
                return Err(Error::InvalidData(format!(
                    "{}.{} holds {}, got {}",
                    owner.entity_name(),
                    relation,
                    target,
                    name
                )));
            }
        }

        for member in members {
            let current = member.reference(&mapped_by)?;
            if current.as_ref() != Some(&owner) {
                member.assign_reference(&mapped_by, Some(owner.clone()))?;
                if let Some(previous) = current.as_ref().and_then(Reference::get) {
                    if let Ok(collection) = previous.collection(&relation) {
                        collection.detach_member(&member.key());
                    }
                }
            }
            self.attach_member(Reference::from(*member));
        }
        Ok(())
    }

    /// Remove members. A member's back-reference is cleared when the
    /// relation allows it; otherwise the member is left pointing at the
    /// owner.
    pub fn remove(&self, members: &[&Entity]) -> Result<(), Error> {
        let (owner, mapped_by) = {
            let state = self.inner.read();
            (state.owner.clone(), state.mapped_by.clone())
        };

        for member in members {
            self.detach_member(&member.key());

            let meta = member.metadata();
            let clearable = meta
                .get_relation(&mapped_by)
                .is_some_and(|r| r.nullable && !meta.is_key_component(&r.name));
            if clearable && member.reference(&mapped_by)?.as_ref() == Some(&owner) {
                member.assign_reference(&mapped_by, None)?;
            }
        }
        Ok(())
    }

    /// Fetch the member set if needed and return the member instances.
    pub fn load(&self, uow: &mut UnitOfWork) -> Result<Vec<Entity>, Error> {
        uow.collection_members(self)
    }

    /// All members as instances; loads first when the collection is
    /// unloaded.
    pub fn to_array(&self, uow: &mut UnitOfWork) -> Result<Vec<Entity>, Error> {
        self.load(uow)
    }

    /// Record a member without touching its back-reference.
    pub(crate) fn attach_member(&self, member: Reference) {
        let mut state = self.inner.write();
        state.removed.retain(|r| r != &member);
        match state.items.iter_mut().find(|r| **r == member) {
            Some(existing) => {
                if member.is_loaded() {
                    *existing = member;
                }
            }
            None => state.items.push(member),
        }
    }

    /// Forget a member without touching its back-reference.
    pub(crate) fn detach_member(&self, key: &PrimaryKey) {
        let mut state = self.inner.write();
        let before = state.items.len();
        state.items.retain(|r| r.key() != key);
        if state.items.len() != before || !state.loaded {
            let reference = Reference::from_key(state.target.clone(), key.clone());
            if !state.removed.contains(&reference) {
                state.removed.push(reference);
            }
        }
    }

    /// Merge fetched members under local changes and mark loaded. Fetched
    /// order is kept; local instances win for duplicate keys; local
    /// additions missing from storage go last.
    pub(crate) fn merge_loaded(&self, fetched: Vec<Reference>) {
        let mut state = self.inner.write();
        let mut merged: Vec<Reference> = Vec::with_capacity(fetched.len() + state.items.len());
        for reference in fetched {
            if state.removed.contains(&reference) || merged.contains(&reference) {
                continue;
            }
            match state.items.iter().find(|local| **local == reference) {
                Some(local) if local.is_loaded() => merged.push(local.clone()),
                _ => merged.push(reference),
            }
        }
        for local in &state.items {
            if !merged.contains(local) {
                merged.push(local.clone());
            }
        }
        state.items = merged;
        state.removed.clear();
        state.loaded = true;
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("Collection")
            .field("owner", &state.owner)
            .field("relation", &state.relation)
            .field("items", &state.items.len())
            .field("loaded", &state.loaded)
            .finish()
    }
}
