//! Cascade planner for removals.
//!
//! Removing an entity applies the delete policy of every relation that
//! depends on it, over the instances the session currently manages:
//! - CASCADE: remove dependents recursively
//! - SET NULL: clear the dependent's reference and stage it for update
//! - NONE: leave dependents untouched (storage may reject the delete)
//!
//! Dependents are found through to-one relations that target the removed
//! entity, and through the removed entity's own loaded to-many collections
//! using the collection's policy. Nothing here performs I/O.

use super::entity::Entity;
use super::identity_map::IdentityMap;
use super::reference::Reference;
use crate::catalog::{DeleteBehavior, MetadataRegistry};
use crate::error::Error;
use ormkit_proto::PrimaryKey;
use std::collections::HashSet;
use tracing::debug;

/// Entities affected by one removal.
#[derive(Debug, Default)]
pub(crate) struct CascadePlan {
    /// Entities to remove, the requested one first.
    pub(crate) removals: Vec<Entity>,
    /// Dependents whose reference must be cleared, with the relation name.
    pub(crate) nullified: Vec<(Entity, String)>,
}

/// Plans cascades against the identity map.
pub(crate) struct CascadePlanner<'a> {
    registry: &'a MetadataRegistry,
    identity_map: &'a IdentityMap,
    max_depth: usize,
    /// Instances already staged for removal; never revisited or updated.
    staged_removals: Vec<Entity>,
}

impl<'a> CascadePlanner<'a> {
    pub(crate) fn new(registry: &'a MetadataRegistry, identity_map: &'a IdentityMap, max_depth: usize) -> Self {
        Self {
            registry,
            identity_map,
            max_depth,
            staged_removals: Vec::new(),
        }
    }

    /// Skip instances that earlier removals already staged.
    pub(crate) fn with_staged_removals(mut self, removals: impl IntoIterator<Item = Entity>) -> Self {
        self.staged_removals.extend(removals);
        self
    }

    fn is_leaving(&self, candidate: &Entity) -> bool {
        candidate.is_removed() || self.staged_removals.iter().any(|e| e.same_instance(candidate))
    }

    /// Plan the removal of `root` and everything its removal implies.
    pub(crate) fn plan(&self, root: &Entity) -> Result<CascadePlan, Error> {
        let mut plan = CascadePlan::default();
        let mut visited = HashSet::new();
        self.visit(root, &mut plan, &mut visited, 0)?;

        // A dependent that is removed anyway needs no update.
        let removed: HashSet<(String, PrimaryKey)> = plan
            .removals
            .iter()
            .map(|e| (e.entity_name(), e.key()))
            .collect();
        plan.nullified
            .retain(|(e, _)| !removed.contains(&(e.entity_name(), e.key())));

        debug!(
            entity = %root.entity_name(),
            key = %root.key(),
            removals = plan.removals.len(),
            nullified = plan.nullified.len(),
            "planned cascade"
        );
        Ok(plan)
    }

    fn visit(
        &self,
        entity: &Entity,
        plan: &mut CascadePlan,
        visited: &mut HashSet<(String, PrimaryKey)>,
        depth: usize,
    ) -> Result<(), Error> {
        if depth > self.max_depth {
            return Err(Error::CascadeDepthExceeded { depth });
        }

        let name = entity.entity_name();
        let key = entity.key();
        if !visited.insert((name.clone(), key.clone())) {
            return Ok(());
        }
        plan.removals.push(entity.clone());

        // Managed instances whose to-one reference points here.
        let target = Reference::from_key(name.clone(), key);
        for (source, relation) in self.registry.relations_targeting(&name) {
            if relation.on_delete == DeleteBehavior::None {
                continue;
            }
            let dependents: Vec<Entity> = self
                .identity_map
                .of_type(&source.name)
                .filter(|candidate| !self.is_leaving(candidate))
                .cloned()
                .collect();

            for dependent in dependents {
                if dependent.reference(&relation.name)?.as_ref() != Some(&target) {
                    continue;
                }
                match relation.on_delete {
                    DeleteBehavior::Cascade => self.visit(&dependent, plan, visited, depth + 1)?,
                    DeleteBehavior::SetNull => plan.nullified.push((dependent, relation.name.clone())),
                    DeleteBehavior::None => {}
                }
            }
        }

        // Members of this entity's collections, under the collection's policy.
        let meta = entity.metadata();
        for relation in meta.to_many_relations() {
            if relation.on_delete == DeleteBehavior::None {
                continue;
            }
            let Some(mapped_by) = relation.mapped_by.as_deref() else {
                continue;
            };
            for member in entity.collection(&relation.name)?.entities() {
                if self.is_leaving(&member) || !self.identity_map.contains(&member) {
                    continue;
                }
                match relation.on_delete {
                    DeleteBehavior::Cascade => self.visit(&member, plan, visited, depth + 1)?,
                    DeleteBehavior::SetNull => {
                        let clearable = member.reference(mapped_by)?.as_ref() == Some(&target);
                        if clearable {
                            plan.nullified.push((member, mapped_by.to_string()));
                        }
                    }
                    DeleteBehavior::None => {}
                }
            }
        }

        Ok(())
    }
}
