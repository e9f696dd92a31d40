//! Flush planning: turns staged work into one ordered change batch.
//!
//! Batch layout:
//! 1. Inserts, referenced rows before referencing rows
//! 2. Follow-up updates for nullable references deferred to break cycles
//! 3. Updates of persisted instances whose row changed
//! 4. Deletes, referencing rows before the rows they reference
//!
//! Ties are broken by staging order.

use super::entity::Entity;
use super::identity_map::IdentityMap;
use super::unit_of_work::{StagedChange, StagedOp};
use crate::catalog::MetadataRegistry;
use crate::error::Error;
use ormkit_proto::{Change, ChangeBatch, PrimaryKey, Row, Value};
use std::collections::HashMap;

/// An ordered change batch and the instances it touches.
#[derive(Debug, Default)]
pub(crate) struct FlushPlan {
    pub(crate) batch: ChangeBatch,
    /// Inserted or updated instances, to be snapshotted after success.
    pub(crate) written: Vec<Entity>,
    /// Deleted instances, to be detached after success.
    pub(crate) deleted: Vec<Entity>,
}

/// A pending dependency of one insert on another.
struct Dependency {
    target: usize,
    relation: String,
    required: bool,
}

type IdentityKey = (String, PrimaryKey);

fn identity(entity: &Entity) -> IdentityKey {
    (entity.entity_name(), entity.key())
}

/// Build the flush plan for the staged changes.
pub(crate) fn plan(
    registry: &MetadataRegistry,
    staged: &[StagedChange],
    identity_map: &IdentityMap,
    dirty_check_managed: bool,
) -> Result<FlushPlan, Error> {
    let mut plan = FlushPlan::default();

    let inserts: Vec<Entity> = staged
        .iter()
        .filter(|c| c.op == StagedOp::Persist && c.entity.is_new())
        .map(|c| c.entity.clone())
        .collect();
    let fixups = plan_inserts(registry, &inserts, &mut plan)?;
    for change in fixups {
        plan.batch.push(change);
    }

    // Updates: staged instances first, then every other managed instance.
    let mut candidates: Vec<Entity> = staged
        .iter()
        .filter(|c| c.op == StagedOp::Persist && !c.entity.is_new())
        .map(|c| c.entity.clone())
        .collect();
    if dirty_check_managed {
        let removing: Vec<&Entity> = staged
            .iter()
            .filter(|c| c.op == StagedOp::Remove)
            .map(|c| &c.entity)
            .collect();
        for managed in identity_map.iter() {
            let skip = managed.is_new()
                || candidates.iter().any(|c| c.same_instance(managed))
                || removing.iter().any(|r| r.same_instance(managed));
            if !skip {
                candidates.push(managed.clone());
            }
        }
    }
    for entity in candidates {
        let Some(snapshot) = entity.snapshot() else {
            continue;
        };
        let changed = entity.row(registry)?.diff(&snapshot);
        if !changed.is_empty() {
            plan.batch
                .push(Change::update(entity.entity_name(), entity.key(), changed));
            plan.written.push(entity);
        }
    }

    let deletes: Vec<Entity> = staged
        .iter()
        .filter(|c| c.op == StagedOp::Remove && !c.entity.is_new())
        .map(|c| c.entity.clone())
        .collect();
    plan_deletes(&deletes, &mut plan)?;

    Ok(plan)
}

/// Order inserts and push them onto the batch. Returns the follow-up
/// updates for references that had to be inserted as null.
fn plan_inserts(
    registry: &MetadataRegistry,
    inserts: &[Entity],
    plan: &mut FlushPlan,
) -> Result<Vec<Change>, Error> {
    let index: HashMap<IdentityKey, usize> = inserts
        .iter()
        .enumerate()
        .map(|(i, e)| (identity(e), i))
        .collect();

    let mut rows = Vec::with_capacity(inserts.len());
    let mut dependencies: Vec<Vec<Dependency>> = Vec::with_capacity(inserts.len());
    for (i, entity) in inserts.iter().enumerate() {
        rows.push(entity.row(registry)?);
        let meta = entity.metadata();
        let mut deps = Vec::new();
        for (relation, reference) in entity.references() {
            let Some(reference) = reference else { continue };
            let target_key = (reference.entity_name().to_string(), reference.key().clone());
            let Some(&target) = index.get(&target_key) else {
                continue;
            };
            // A row referencing itself is satisfied by its own insert.
            if target == i {
                continue;
            }
            let required = meta
                .get_relation(&relation)
                .map_or(true, |r| !r.nullable || meta.is_key_component(&r.name));
            deps.push(Dependency {
                target,
                relation,
                required,
            });
        }
        dependencies.push(deps);
    }

    let mut done = vec![false; inserts.len()];
    let mut fixups = Vec::new();
    for _ in 0..inserts.len() {
        let ready = (0..inserts.len())
            .find(|&i| !done[i] && dependencies[i].iter().all(|d| done[d.target]));
        let next = match ready {
            Some(i) => i,
            None => {
                // Break the cycle at the earliest insert whose required
                // references are all satisfied.
                let i = (0..inserts.len())
                    .find(|&i| {
                        !done[i]
                            && dependencies[i]
                                .iter()
                                .all(|d| done[d.target] || !d.required)
                    })
                    .ok_or_else(|| required_cycle(inserts, &done))?;

                let entity = &inserts[i];
                let meta = entity.metadata();
                let mut fixup = Row::new();
                for dep in dependencies[i].iter().filter(|d| !done[d.target]) {
                    let Some(relation) = meta.get_relation(&dep.relation) else {
                        continue;
                    };
                    for column in registry.join_columns(&meta, relation)? {
                        if let Some(value) = rows[i].get(&column).cloned() {
                            fixup.set(column.clone(), value);
                        }
                        rows[i].set(column, Value::Null);
                    }
                }
                fixups.push(Change::update(entity.entity_name(), entity.key(), fixup));
                i
            }
        };

        done[next] = true;
        let entity = &inserts[next];
        plan.batch.push(Change::insert(
            entity.entity_name(),
            entity.key(),
            std::mem::take(&mut rows[next]),
        ));
        plan.written.push(entity.clone());
    }

    Ok(fixups)
}

fn required_cycle(inserts: &[Entity], done: &[bool]) -> Error {
    let pending: Vec<String> = inserts
        .iter()
        .zip(done)
        .filter(|(_, done)| !**done)
        .map(|(e, _)| format!("{} {}", e.entity_name(), e.key()))
        .collect();
    Error::ConstraintViolation(format!(
        "required references form a cycle among pending inserts: {}",
        pending.join(", ")
    ))
}

/// Order deletes so a row is deleted before any row it references.
fn plan_deletes(deletes: &[Entity], plan: &mut FlushPlan) -> Result<(), Error> {
    let index: HashMap<IdentityKey, usize> = deletes
        .iter()
        .enumerate()
        .map(|(i, e)| (identity(e), i))
        .collect();

    // referrers[j] lists deletes whose row points at delete j.
    let mut referrers: Vec<Vec<usize>> = vec![Vec::new(); deletes.len()];
    for (i, entity) in deletes.iter().enumerate() {
        for (_, reference) in entity.references() {
            let Some(reference) = reference else { continue };
            let key = (reference.entity_name().to_string(), reference.key().clone());
            if let Some(&j) = index.get(&key) {
                if j != i && !referrers[j].contains(&i) {
                    referrers[j].push(i);
                }
            }
        }
    }

    let mut done = vec![false; deletes.len()];
    for _ in 0..deletes.len() {
        let next = (0..deletes.len())
            .find(|&j| !done[j] && referrers[j].iter().all(|&i| done[i]))
            .or_else(|| (0..deletes.len()).find(|&j| !done[j]));
        let Some(next) = next else { break };

        done[next] = true;
        let entity = &deletes[next];
        plan.batch
            .push(Change::delete(entity.entity_name(), entity.key()));
        plan.deleted.push(entity.clone());
    }
    Ok(())
}
