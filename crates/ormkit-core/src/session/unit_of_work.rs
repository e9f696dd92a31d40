//! Unit of work: the session that tracks instances and flushes changes.

use super::cascade::CascadePlanner;
use super::collection::Collection;
use super::config::SessionConfig;
use super::entity::{Entity, EntityData};
use super::flush::{self, FlushPlan};
use super::identity_map::IdentityMap;
use super::reference::Reference;
use crate::catalog::{EntityMetadata, KeyComponent, MetadataRegistry};
use crate::error::Error;
use crate::serialize::{self, SerializeOptions};
use crate::storage::{BackendError, RelatedRequest, StorageBackend};
use ormkit_proto::{KeyValue, PrimaryKey, Row, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting work.
    Active,
    /// Compiling and applying a change batch.
    Flushing,
    /// The last flush failed; staged work is intact and can be retried.
    ActiveWithError,
    /// A flush was cut off mid-batch; only `close` is allowed.
    Interrupted,
    /// Closed; every operation fails with `SessionClosed`.
    Closed,
}

/// Kind of staged work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedOp {
    /// Insert a new instance, or update a persisted one.
    Persist,
    /// Delete the instance.
    Remove,
}

/// One staged instance.
#[derive(Debug, Clone)]
pub(crate) struct StagedChange {
    pub(crate) op: StagedOp,
    pub(crate) entity: Entity,
}

/// Read-only view of a staged change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// Staged operation.
    pub op: StagedOp,
    /// Entity type.
    pub entity: String,
    /// Primary key.
    pub key: PrimaryKey,
}

/// Options for `find_with`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Relation paths to load, dotted for nested relations (`chapters.book`).
    pub populate: Vec<String>,
}

impl FindOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relation path to load.
    pub fn populate(mut self, path: impl Into<String>) -> Self {
        self.populate.push(path.into());
        self
    }
}

/// A session: identity map, staged changes, and the backend they flush to.
///
/// One unit of work serves one logical request. It is not meant to be
/// shared between threads, and instances it manages must not be handed to
/// another session.
pub struct UnitOfWork {
    id: u64,
    registry: Arc<MetadataRegistry>,
    backend: Arc<dyn StorageBackend>,
    config: SessionConfig,
    identity_map: IdentityMap,
    staged: Vec<StagedChange>,
    state: SessionState,
}

impl UnitOfWork {
    /// Open a session with default configuration.
    pub fn new(registry: Arc<MetadataRegistry>, backend: Arc<dyn StorageBackend>) -> Result<Self, Error> {
        Self::with_config(registry, backend, SessionConfig::default())
    }

    /// Open a session. Cross-entity metadata is validated first.
    pub fn with_config(
        registry: Arc<MetadataRegistry>,
        backend: Arc<dyn StorageBackend>,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        registry.validate()?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "opened session");
        Ok(Self {
            id,
            registry,
            backend,
            config,
            identity_map: IdentityMap::new(),
            staged: Vec::new(),
            state: SessionState::Active,
        })
    }

    /// Session identifier, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The metadata registry.
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Check if this exact instance is tracked by the session.
    pub fn is_managed(&self, entity: &Entity) -> bool {
        self.identity_map.contains(entity)
    }

    /// Number of tracked instances.
    pub fn managed_count(&self) -> usize {
        self.identity_map.len()
    }

    /// Staged changes, in staging order.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.staged
            .iter()
            .map(|c| PendingChange {
                op: c.op,
                entity: c.entity.entity_name(),
                key: c.entity.key(),
            })
            .collect()
    }

    /// Construct a new instance, register it, and stage it for insert.
    pub fn create(&mut self, entity: &str, data: EntityData) -> Result<Entity, Error> {
        self.ensure_usable()?;
        let meta = self.registry.get(entity)?;

        let mut provided: HashMap<String, Value> = HashMap::new();
        for (field, value) in data.values {
            if meta.get_field(&field).is_none() {
                return Err(Error::unknown_field(entity, &field));
            }
            provided.insert(field, value);
        }
        let mut values = Vec::with_capacity(meta.fields.len());
        for field in &meta.fields {
            let value = match provided.remove(&field.name) {
                Some(value) => field.accept(entity, value)?,
                None => field.initial_value().ok_or_else(|| {
                    Error::InvalidData(format!("{}.{} is required", entity, field.name))
                })?,
            };
            values.push(value);
        }

        let mut given: HashMap<String, Option<Reference>> = HashMap::new();
        for (relation, target) in data.references {
            if meta.get_relation(&relation).filter(|r| r.is_to_one()).is_none() {
                return Err(Error::unknown_relation(entity, &relation));
            }
            given.insert(relation, target);
        }
        let mut references = HashMap::new();
        for relation in meta.to_one_relations() {
            let target = given.remove(&relation.name).flatten();
            match &target {
                None if !relation.nullable => {
                    return Err(Error::InvalidData(format!(
                        "{}.{} is required",
                        entity, relation.name
                    )));
                }
                Some(r) if r.entity_name() != relation.target => {
                    return Err(Error::InvalidData(format!(
                        "{}.{} expects {}, got {}",
                        entity,
                        relation.name,
                        relation.target,
                        r.entity_name()
                    )));
                }
                _ => {}
            }
            let target = target.map(|r| self.normalize_reference(r)).transpose()?;
            references.insert(relation.name.clone(), target);
        }

        let key = self.key_for(&meta, &values, &references)?;
        if self.identity_map.contains_key(entity, &key) {
            return Err(Error::InvalidData(format!(
                "{} {} is already managed by this session",
                entity, key
            )));
        }

        let instance = Entity::build(Arc::clone(&meta), key, values, references, false);
        self.identity_map.insert(instance.clone())?;
        self.staged.push(StagedChange {
            op: StagedOp::Persist,
            entity: instance.clone(),
        });

        // Keep loaded inverse collections in step with the new references.
        let own = Reference::from(&instance);
        for (relation, target) in instance.references() {
            if let Some(target) = target.as_ref().and_then(Reference::get) {
                if let Some(collection) = target.inverse_collection(entity, &relation) {
                    collection.attach_member(own.clone());
                }
            }
        }

        debug!(session = self.id, entity, key = %own.key(), "created entity");
        Ok(instance)
    }

    /// Find an instance by key: the identity map first, storage otherwise.
    pub fn find(&mut self, entity: &str, key: impl Into<PrimaryKey>) -> Result<Entity, Error> {
        self.find_with(entity, key, &FindOptions::default())
    }

    /// Find an instance by key and load the given relation paths.
    pub fn find_with(
        &mut self,
        entity: &str,
        key: impl Into<PrimaryKey>,
        options: &FindOptions,
    ) -> Result<Entity, Error> {
        let key = key.into();
        let instance = self.find_one(entity, &key)?;
        let paths: Vec<String> = self
            .config
            .default_populate
            .iter()
            .chain(&options.populate)
            .cloned()
            .collect();
        for path in paths {
            self.populate(&instance, &path)?;
        }
        Ok(instance)
    }

    /// Stage an instance for insert or update.
    ///
    /// Staging twice is a no-op; an instance staged for removal stays staged
    /// for removal.
    pub fn persist(&mut self, entity: &Entity) -> Result<(), Error> {
        self.ensure_usable()?;
        self.ensure_managed(entity)?;
        if !self.staged.iter().any(|c| c.entity.same_instance(entity)) {
            self.staged.push(StagedChange {
                op: StagedOp::Persist,
                entity: entity.clone(),
            });
        }
        Ok(())
    }

    /// Stage an instance for deletion and apply delete policies to the
    /// managed instances that depend on it.
    pub fn remove(&mut self, entity: &Entity) -> Result<(), Error> {
        self.ensure_usable()?;
        self.ensure_managed(entity)?;
        let already = self
            .staged
            .iter()
            .any(|c| c.op == StagedOp::Remove && c.entity.same_instance(entity));
        if already {
            return Ok(());
        }

        let staged_removals = self
            .staged
            .iter()
            .filter(|c| c.op == StagedOp::Remove)
            .map(|c| c.entity.clone());
        let plan = CascadePlanner::new(&self.registry, &self.identity_map, self.config.max_cascade_depth)
            .with_staged_removals(staged_removals)
            .plan(entity)?;

        for (dependent, relation) in &plan.nullified {
            dependent.set_reference(relation, None)?;
            self.persist(dependent)?;
        }
        for removed in &plan.removals {
            self.stage_removal(removed);
        }
        Ok(())
    }

    /// Compute the change batch for staged work and apply it.
    ///
    /// On failure the staged work is left intact for inspection or retry.
    #[instrument(skip(self), fields(session = self.id))]
    pub fn flush(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        self.state = SessionState::Flushing;

        let plan = match flush::plan(
            &self.registry,
            &self.staged,
            &self.identity_map,
            self.config.dirty_check_managed,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                self.state = SessionState::ActiveWithError;
                return Err(e);
            }
        };

        if !plan.batch.is_empty() {
            debug!(changes = plan.batch.len(), "applying change batch");
            if let Err(e) = self.backend.apply_change_batch(&plan.batch) {
                return Err(self.flush_failed(e));
            }
        }

        let changes = plan.batch.len();
        if let Err(e) = self.after_flush(plan) {
            self.state = SessionState::ActiveWithError;
            return Err(e);
        }
        self.state = SessionState::Active;
        info!(changes, "flush complete");
        Ok(())
    }

    /// Stage an instance and flush.
    pub fn persist_and_flush(&mut self, entity: &Entity) -> Result<(), Error> {
        self.persist(entity)?;
        self.flush()
    }

    /// Forget every instance and all staged work. Storage is untouched and
    /// the session stays open; handles held by callers become detached.
    pub fn clear(&mut self) -> Result<(), Error> {
        if self.state == SessionState::Closed {
            return Err(Error::SessionClosed);
        }
        debug!(
            session = self.id,
            managed = self.identity_map.len(),
            staged = self.staged.len(),
            "cleared session"
        );
        self.identity_map.clear();
        self.staged.clear();
        if self.state != SessionState::Interrupted {
            self.state = SessionState::Active;
        }
        Ok(())
    }

    /// Close the session.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if !self.staged.is_empty() {
            warn!(session = self.id, staged = self.staged.len(), "closing session with unflushed changes");
        }
        self.identity_map.clear();
        self.staged.clear();
        self.state = SessionState::Closed;
        debug!(session = self.id, "closed session");
    }

    /// Load the target of a to-one relation of a managed instance.
    pub fn load_reference(&mut self, entity: &Entity, relation: &str) -> Result<Option<Entity>, Error> {
        self.ensure_usable()?;
        self.ensure_managed(entity)?;
        let Some(mut reference) = entity.reference(relation)? else {
            return Ok(None);
        };
        let target = self.resolve_reference(&mut reference)?;
        entity.resolve_reference(relation, &target);
        Ok(Some(target))
    }

    /// Load the members of a to-many relation of a managed instance.
    pub fn load_collection(&mut self, entity: &Entity, relation: &str) -> Result<Vec<Entity>, Error> {
        let collection = entity.collection(relation)?;
        self.collection_members(&collection)
    }

    /// Load relation paths (`chapters`, `chapters.book`) of a managed instance.
    pub fn populate(&mut self, entity: &Entity, path: &str) -> Result<(), Error> {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        self.populate_segments(entity, &segments)
    }

    /// Serialize an instance to a JSON value tree.
    pub fn to_object(&mut self, entity: &Entity, options: &SerializeOptions) -> Result<serde_json::Value, Error> {
        serialize::to_object(self, entity, options)
    }

    /// Resolve a reference through the identity map, loading from storage
    /// on a miss, and cache the instance on the reference.
    pub(crate) fn resolve_reference(&mut self, reference: &mut Reference) -> Result<Entity, Error> {
        self.ensure_usable()?;
        if let Some(cached) = reference.get() {
            if self.identity_map.contains(&cached) {
                return Ok(cached);
            }
        }
        let entity = reference.entity_name().to_string();
        let key = reference.key().clone();
        let target = self.find_one(&entity, &key)?;
        *reference = Reference::from(&target);
        Ok(target)
    }

    /// Members of a collection, fetching them first if it is unloaded.
    pub(crate) fn collection_members(&mut self, collection: &Collection) -> Result<Vec<Entity>, Error> {
        self.ensure_usable()?;
        let owner_ref = collection.owner();
        let owner = owner_ref
            .get()
            .filter(|owner| self.identity_map.contains(owner))
            .ok_or_else(|| Error::DetachedEntity {
                entity: owner_ref.entity_name().to_string(),
                key: owner_ref.key().clone(),
            })?;

        if !collection.is_loaded() {
            let meta = owner.metadata();
            let relation_name = collection.relation_name();
            let relation = meta
                .get_relation(&relation_name)
                .ok_or_else(|| Error::unknown_relation(&meta.name, &relation_name))?;
            let target = self.registry.get(&relation.target)?;
            let mapped_by = relation.mapped_by.as_deref().unwrap_or_default();
            let inverse = target
                .get_relation(mapped_by)
                .ok_or_else(|| Error::unknown_relation(&target.name, mapped_by))?;

            let request = RelatedRequest {
                owner_entity: meta.name.clone(),
                owner_key: owner_ref.key().clone(),
                relation: relation_name.clone(),
                target_entity: target.name.clone(),
                join_columns: self.registry.join_columns(&target, inverse)?,
            };
            let rows = self.backend.load_related(&request)?;
            debug!(
                session = self.id,
                entity = %meta.name,
                key = %owner_ref.key(),
                relation = %relation_name,
                rows = rows.len(),
                "loaded collection"
            );

            let mut fetched = Vec::with_capacity(rows.len());
            for row in rows {
                let member = self.hydrate(&target, row)?;
                fetched.push(Reference::from(&member));
            }
            collection.merge_loaded(fetched);
        }

        let mut members = Vec::new();
        for mut item in collection.items() {
            let member = self.resolve_reference(&mut item)?;
            collection.attach_member(item);
            members.push(member);
        }
        Ok(members)
    }

    fn populate_segments(&mut self, entity: &Entity, segments: &[&str]) -> Result<(), Error> {
        let Some((head, rest)) = segments.split_first() else {
            return Ok(());
        };
        let meta = entity.metadata();
        let relation = meta
            .get_relation(head)
            .ok_or_else(|| Error::unknown_relation(&meta.name, head))?;

        let targets = if relation.is_to_one() {
            self.load_reference(entity, head)?.into_iter().collect()
        } else {
            self.load_collection(entity, head)?
        };
        for target in targets {
            self.populate_segments(&target, rest)?;
        }
        Ok(())
    }

    fn find_one(&mut self, entity: &str, key: &PrimaryKey) -> Result<Entity, Error> {
        self.ensure_usable()?;
        let meta = self.registry.get(entity)?;
        let key = self.normalize_key(entity, key)?;
        if let Some(instance) = self.identity_map.get(entity, &key) {
            return Ok(instance);
        }

        let row = self
            .backend
            .load_by_key(entity, &key)?
            .ok_or_else(|| Error::NotFound {
                entity: entity.to_string(),
                key: key.clone(),
            })?;
        self.hydrate(&meta, row)
    }

    /// Register an instance for a stored row. An instance already managed
    /// under the row's key wins over the row.
    fn hydrate(&mut self, meta: &Arc<EntityMetadata>, row: Row) -> Result<Entity, Error> {
        let columns = self.registry.key_columns(&meta.name)?;
        let key_values = columns
            .iter()
            .map(|c| {
                row.get(c).cloned().ok_or_else(|| {
                    Error::InvalidData(format!("{} row is missing key column '{}'", meta.name, c))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let key = PrimaryKey::from_values(key_values)?;

        let mut references = HashMap::new();
        for relation in meta.to_one_relations() {
            let join = self.registry.join_columns(meta, relation)?;
            let values: Vec<Value> = join
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            let target = if values.iter().all(Value::is_null) {
                None
            } else {
                let mut reference =
                    Reference::from_key(relation.target.clone(), PrimaryKey::from_values(values)?);
                if let Some(managed) = self.identity_map.get(&relation.target, reference.key()) {
                    reference.attach(&managed);
                }
                Some(reference)
            };
            references.insert(relation.name.clone(), target);
        }
        let values: Vec<Value> = meta
            .fields
            .iter()
            .map(|f| row.get(&f.name).cloned().unwrap_or(Value::Null))
            .collect();

        let mut created = false;
        let instance = self.identity_map.get_or_create(&meta.name, &key, || {
            created = true;
            Ok(Entity::build(Arc::clone(meta), key.clone(), values, references, true))
        })?;

        if created {
            instance.mark_persisted(instance.row(&self.registry)?);
            debug!(session = self.id, entity = %meta.name, key = %key, "hydrated entity");
        }
        Ok(instance)
    }

    /// Coerce each key component to its declared column type, so `7i32`
    /// finds an int64 key and `1i64` an int32 one when the value fits.
    fn normalize_key(&self, entity: &str, key: &PrimaryKey) -> Result<PrimaryKey, Error> {
        let types = self.registry.key_types(entity)?;
        if types.len() != key.len() {
            return Err(Error::InvalidData(format!(
                "{} has {} key components, got {}",
                entity,
                types.len(),
                key.len()
            )));
        }
        let values = types
            .iter()
            .zip(key.values())
            .map(|(scalar, value)| {
                scalar.coerce(value.clone()).ok_or_else(|| {
                    Error::InvalidData(format!("{} key value {} is not {:?}", entity, value, scalar))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PrimaryKey::from_values(values)?)
    }

    fn normalize_reference(&self, reference: Reference) -> Result<Reference, Error> {
        let key = self.normalize_key(reference.entity_name(), reference.key())?;
        Ok(reference.with_key(key))
    }

    fn key_for(
        &self,
        meta: &EntityMetadata,
        values: &[Value],
        references: &HashMap<String, Option<Reference>>,
    ) -> Result<PrimaryKey, Error> {
        let mut components: Vec<KeyValue> = Vec::new();
        for component in meta.primary_key.components() {
            match meta.key_component(component) {
                Some(KeyComponent::Field(field)) => {
                    let index = meta
                        .field_index(&field.name)
                        .ok_or_else(|| Error::unknown_field(&meta.name, &field.name))?;
                    components.push(KeyValue::try_from(values[index].clone())?);
                }
                Some(KeyComponent::Reference(relation)) => {
                    let target = references
                        .get(&relation.name)
                        .cloned()
                        .flatten()
                        .ok_or_else(|| {
                            Error::InvalidData(format!("{}.{} is required", meta.name, relation.name))
                        })?;
                    components.extend(target.key().components().iter().cloned());
                }
                None => return Err(Error::unknown_field(&meta.name, component)),
            }
        }
        Ok(PrimaryKey::new(components)?)
    }

    fn stage_removal(&mut self, entity: &Entity) {
        let name = entity.entity_name();
        let key = entity.key();

        // Drop the instance from the collections that list it.
        for (relation, target) in entity.references() {
            if let Some(owner) = target.as_ref().and_then(Reference::get) {
                if let Some(collection) = owner.inverse_collection(&name, &relation) {
                    collection.detach_member(&key);
                }
            }
        }

        if entity.is_new() {
            // Never reached storage: forget it.
            self.staged.retain(|c| !c.entity.same_instance(entity));
            self.identity_map.remove(&name, &key);
            entity.mark_removed();
            debug!(session = self.id, entity = %name, key = %key, "discarded unsaved entity");
            return;
        }

        match self.staged.iter_mut().find(|c| c.entity.same_instance(entity)) {
            Some(change) => change.op = StagedOp::Remove,
            None => self.staged.push(StagedChange {
                op: StagedOp::Remove,
                entity: entity.clone(),
            }),
        }
    }

    fn after_flush(&mut self, plan: FlushPlan) -> Result<(), Error> {
        for entity in &plan.written {
            entity.mark_persisted(entity.row(&self.registry)?);
        }
        for entity in &plan.deleted {
            self.identity_map.remove(&entity.entity_name(), &entity.key());
            entity.mark_removed();
        }
        self.staged.clear();
        Ok(())
    }

    fn flush_failed(&mut self, error: BackendError) -> Error {
        let error = Error::from(error);
        self.state = if matches!(error, Error::FlushInterrupted) {
            SessionState::Interrupted
        } else {
            SessionState::ActiveWithError
        };
        warn!(session = self.id, error = %error, "flush failed");
        error
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        match self.state {
            SessionState::Closed => Err(Error::SessionClosed),
            SessionState::Interrupted => Err(Error::FlushInterrupted),
            _ => Ok(()),
        }
    }

    fn ensure_managed(&self, entity: &Entity) -> Result<(), Error> {
        if self.identity_map.contains(entity) {
            Ok(())
        } else {
            Err(Error::DetachedEntity {
                entity: entity.entity_name(),
                key: entity.key(),
            })
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.close();
    }
}
