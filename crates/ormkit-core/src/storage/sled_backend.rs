//! Sled-backed storage backend.
//!
//! Every row lives in one tree under `entity \0 encoded-key`. A change batch
//! is validated against an in-memory overlay of the batch's own effects and
//! committed with a single sled batch, so a rejected batch writes nothing.
//!
//! Delete rules are enforced here as well, for rows the session never
//! loaded:
//! - CASCADE: dependent rows are deleted recursively
//! - SET NULL: dependent rows have their join columns cleared
//! - NONE: the batch is rejected if a dependent row survives it

use super::backend::{BackendError, RelatedRequest, StorageBackend};
use super::config::StorageConfig;
use super::record::StoredRow;
use crate::catalog::{DeleteBehavior, EntityMetadata, MetadataRegistry};
use crate::error::Error;
use ormkit_proto::{Change, ChangeBatch, PrimaryKey, Row, Value};
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Tree name for entity rows.
const ROWS_TREE: &str = "rows";

/// Maximum cascade depth to prevent runaway recursion.
const MAX_CASCADE_DEPTH: usize = 100;

/// Pending writes of one batch: `Some` for a put, `None` for a delete.
type Overlay = BTreeMap<Vec<u8>, Option<StoredRow>>;

/// A storage backend on top of a sled database.
pub struct SledBackend {
    /// The underlying sled database.
    db: Db,

    /// Tree of rows.
    rows: Tree,

    /// Metadata used for join columns and delete rules.
    registry: Arc<MetadataRegistry>,

    /// Serializes batch validation and commit.
    write_lock: Mutex<()>,
}

impl SledBackend {
    /// Open or create a backend with the given configuration.
    pub fn open(config: &StorageConfig, registry: Arc<MetadataRegistry>) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let rows = db.open_tree(ROWS_TREE)?;
        debug!(temporary = config.temporary, path = %config.path.display(), "opened sled backend");

        Ok(Self {
            db,
            rows,
            registry,
            write_lock: Mutex::new(()),
        })
    }

    /// Number of stored rows of an entity type.
    pub fn count(&self, entity: &str) -> Result<usize, BackendError> {
        let mut count = 0;
        for item in self.rows.scan_prefix(entity_prefix(entity)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), BackendError> {
        self.db.flush()?;
        Ok(())
    }

    fn read(&self, overlay: &Overlay, storage_key: &[u8]) -> Result<Option<StoredRow>, BackendError> {
        if let Some(pending) = overlay.get(storage_key) {
            return Ok(pending.clone());
        }
        match self.rows.get(storage_key)? {
            Some(bytes) => Ok(Some(StoredRow::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rows of an entity type as the batch would leave them, by key.
    fn scan(&self, entity: &str, overlay: &Overlay) -> Result<BTreeMap<Vec<u8>, StoredRow>, BackendError> {
        let prefix = entity_prefix(entity);
        let mut rows = BTreeMap::new();
        for item in self.rows.scan_prefix(&prefix) {
            let (key, value) = item?;
            rows.insert(key.to_vec(), StoredRow::from_bytes(&value)?);
        }
        for (key, pending) in overlay.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            match pending {
                Some(row) => rows.insert(key.clone(), row.clone()),
                None => rows.remove(key),
            };
        }
        Ok(rows)
    }

    fn metadata(&self, entity: &str) -> Result<Arc<EntityMetadata>, BackendError> {
        self.registry.get(entity).map_err(metadata_error)
    }

    /// Key column values of a stored row.
    fn key_values(&self, entity: &str, row: &Row) -> Result<Vec<Value>, BackendError> {
        let columns = self.registry.key_columns(entity).map_err(metadata_error)?;
        columns
            .iter()
            .map(|c| {
                row.get(c)
                    .cloned()
                    .ok_or_else(|| BackendError::Encoding(format!("{} row has no key column '{}'", entity, c)))
            })
            .collect()
    }

    /// Rows of `source` whose `join` columns hold `key`.
    fn dependents(
        &self,
        source: &str,
        join: &[String],
        key: &[Value],
        overlay: &Overlay,
    ) -> Result<Vec<(Vec<u8>, StoredRow)>, BackendError> {
        Ok(self
            .scan(source, overlay)?
            .into_iter()
            .filter(|(_, stored)| matches_key(&stored.row, join, key))
            .collect())
    }

    /// Delete a row and apply the delete rules of relations targeting it.
    fn delete_row(
        &self,
        entity: &str,
        storage_key: Vec<u8>,
        overlay: &mut Overlay,
        deleted: &mut Vec<(String, Vec<Value>)>,
        visited: &mut HashSet<Vec<u8>>,
        depth: usize,
    ) -> Result<(), BackendError> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(BackendError::Other(format!("cascade depth {} exceeded", depth)));
        }
        if !visited.insert(storage_key.clone()) {
            return Ok(());
        }
        let Some(stored) = self.read(overlay, &storage_key)? else {
            return Ok(());
        };
        let key = self.key_values(entity, &stored.row)?;
        overlay.insert(storage_key, None);

        for (source, relation) in self.registry.relations_targeting(entity) {
            let join = self
                .registry
                .join_columns(&source, &relation)
                .map_err(metadata_error)?;
            match relation.on_delete {
                DeleteBehavior::Cascade => {
                    for (dependent_key, _) in self.dependents(&source.name, &join, &key, overlay)? {
                        self.delete_row(&source.name, dependent_key, overlay, deleted, visited, depth + 1)?;
                    }
                }
                DeleteBehavior::SetNull => {
                    for (dependent_key, mut dependent) in self.dependents(&source.name, &join, &key, overlay)? {
                        for column in &join {
                            dependent.row.set(column.clone(), Value::Null);
                        }
                        overlay.insert(dependent_key, Some(dependent));
                    }
                }
                DeleteBehavior::None => {}
            }
        }

        deleted.push((entity.to_string(), key));
        Ok(())
    }

    /// Every written row must reference rows that exist after the batch.
    fn check_references(&self, entity: &str, row: &Row, overlay: &Overlay) -> Result<(), BackendError> {
        let meta = self.metadata(entity)?;
        for relation in meta.to_one_relations() {
            let join = self
                .registry
                .join_columns(&meta, relation)
                .map_err(metadata_error)?;
            let values: Vec<Value> = join
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            if values.iter().all(Value::is_null) {
                if relation.nullable {
                    continue;
                }
                return Err(BackendError::ConstraintViolation(format!(
                    "{}.{} is required",
                    entity, relation.name
                )));
            }
            let target_key = PrimaryKey::from_values(values)
                .map_err(|e| BackendError::ConstraintViolation(format!("{}.{}: {}", entity, relation.name, e)))?;
            if self.read(overlay, &row_key(&relation.target, &target_key))?.is_none() {
                return Err(BackendError::ConstraintViolation(format!(
                    "{}.{} references missing {} {}",
                    entity, relation.name, relation.target, target_key
                )));
            }
        }
        Ok(())
    }

    /// Rows left pointing at a deleted row through a relation without a
    /// delete rule reject the batch.
    fn check_deleted(&self, entity: &str, key: &[Value], overlay: &Overlay) -> Result<(), BackendError> {
        for (source, relation) in self.registry.relations_targeting(entity) {
            if relation.on_delete != DeleteBehavior::None {
                continue;
            }
            let join = self
                .registry
                .join_columns(&source, &relation)
                .map_err(metadata_error)?;
            let remaining = self.dependents(&source.name, &join, key, overlay)?;
            if !remaining.is_empty() {
                return Err(BackendError::ConstraintViolation(format!(
                    "{} is still referenced by {} {} row(s) through '{}'",
                    entity,
                    remaining.len(),
                    source.name,
                    relation.name
                )));
            }
        }
        Ok(())
    }
}

impl StorageBackend for SledBackend {
    fn load_by_key(&self, entity: &str, key: &PrimaryKey) -> Result<Option<Row>, BackendError> {
        match self.rows.get(row_key(entity, key))? {
            Some(bytes) => Ok(Some(StoredRow::from_bytes(&bytes)?.row)),
            None => Ok(None),
        }
    }

    fn load_related(&self, request: &RelatedRequest) -> Result<Vec<Row>, BackendError> {
        let owner_key = request.owner_key.values();
        let mut related: Vec<StoredRow> = self
            .dependents(&request.target_entity, &request.join_columns, &owner_key, &Overlay::new())?
            .into_iter()
            .map(|(_, stored)| stored)
            .collect();
        related.sort_by_key(|stored| stored.seq);
        Ok(related.into_iter().map(|stored| stored.row).collect())
    }

    fn apply_change_batch(&self, batch: &ChangeBatch) -> Result<(), BackendError> {
        let _guard = self.write_lock.lock();
        let mut overlay = Overlay::new();
        let mut written: Vec<(String, Vec<u8>)> = Vec::new();
        let mut deleted: Vec<(String, Vec<Value>)> = Vec::new();
        let mut visited = HashSet::new();

        for change in batch {
            match change {
                Change::Insert { entity, key, row } => {
                    let storage_key = row_key(entity, key);
                    if self.read(&overlay, &storage_key)?.is_some() {
                        return Err(BackendError::ConstraintViolation(format!(
                            "{} {} already exists",
                            entity, key
                        )));
                    }
                    let seq = self.db.generate_id()?;
                    overlay.insert(storage_key.clone(), Some(StoredRow::new(seq, row.clone())));
                    written.push((entity.clone(), storage_key));
                }
                Change::Update { entity, key, row } => {
                    let storage_key = row_key(entity, key);
                    let mut stored = self.read(&overlay, &storage_key)?.ok_or_else(|| {
                        BackendError::ConstraintViolation(format!("{} {} does not exist", entity, key))
                    })?;
                    stored.row.merge(row);
                    overlay.insert(storage_key.clone(), Some(stored));
                    written.push((entity.clone(), storage_key));
                }
                Change::Delete { entity, key } => {
                    self.delete_row(entity, row_key(entity, key), &mut overlay, &mut deleted, &mut visited, 0)?;
                }
            }
        }

        for (entity, storage_key) in &written {
            if let Some(Some(stored)) = overlay.get(storage_key) {
                self.check_references(entity, &stored.row, &overlay)?;
            }
        }
        for (entity, key) in &deleted {
            self.check_deleted(entity, key, &overlay)?;
        }

        let mut sled_batch = sled::Batch::default();
        for (storage_key, pending) in &overlay {
            match pending {
                Some(stored) => sled_batch.insert(storage_key.as_slice(), stored.to_bytes()?),
                None => sled_batch.remove(storage_key.as_slice()),
            }
        }
        self.rows.apply_batch(sled_batch)?;

        debug!(
            changes = batch.len(),
            written = written.len(),
            deleted = deleted.len(),
            "applied change batch"
        );
        Ok(())
    }
}

/// Storage key prefix for an entity type.
fn entity_prefix(entity: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(entity.len() + 1);
    prefix.extend_from_slice(entity.as_bytes());
    prefix.push(0); // Null separator
    prefix
}

/// Storage key for a row.
fn row_key(entity: &str, key: &PrimaryKey) -> Vec<u8> {
    let mut storage_key = entity_prefix(entity);
    storage_key.extend_from_slice(&key.encode());
    storage_key
}

fn matches_key(row: &Row, join: &[String], key: &[Value]) -> bool {
    join.len() == key.len()
        && join
            .iter()
            .zip(key)
            .all(|(column, value)| row.get(column) == Some(value))
}

fn metadata_error(e: Error) -> BackendError {
    BackendError::Other(e.to_string())
}
