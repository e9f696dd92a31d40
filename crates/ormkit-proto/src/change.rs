//! Change records sent to a storage backend when a session flushes.

use crate::key::PrimaryKey;
use crate::row::Row;

/// A single write (insert, update, or delete).
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert a new row.
    Insert {
        /// Entity type to insert into.
        entity: String,
        /// Key of the new row.
        key: PrimaryKey,
        /// All columns of the new row, key and foreign-key columns included.
        row: Row,
    },
    /// Update an existing row.
    Update {
        /// Entity type to update.
        entity: String,
        /// Key of the row to update.
        key: PrimaryKey,
        /// Changed columns only.
        row: Row,
    },
    /// Delete a row.
    Delete {
        /// Entity type to delete from.
        entity: String,
        /// Key of the row to delete.
        key: PrimaryKey,
    },
}

impl Change {
    /// Create an insert change.
    pub fn insert(entity: impl Into<String>, key: PrimaryKey, row: Row) -> Self {
        Change::Insert {
            entity: entity.into(),
            key,
            row,
        }
    }

    /// Create an update change.
    pub fn update(entity: impl Into<String>, key: PrimaryKey, row: Row) -> Self {
        Change::Update {
            entity: entity.into(),
            key,
            row,
        }
    }

    /// Create a delete change.
    pub fn delete(entity: impl Into<String>, key: PrimaryKey) -> Self {
        Change::Delete {
            entity: entity.into(),
            key,
        }
    }

    /// Get the entity type this change operates on.
    pub fn entity(&self) -> &str {
        match self {
            Change::Insert { entity, .. } => entity,
            Change::Update { entity, .. } => entity,
            Change::Delete { entity, .. } => entity,
        }
    }

    /// Get the key of the affected row.
    pub fn key(&self) -> &PrimaryKey {
        match self {
            Change::Insert { key, .. } => key,
            Change::Update { key, .. } => key,
            Change::Delete { key, .. } => key,
        }
    }

    /// Short operation name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert { .. } => "insert",
            Change::Update { .. } => "update",
            Change::Delete { .. } => "delete",
        }
    }
}

/// An ordered batch of changes a backend applies as one unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    /// Changes to apply, in order.
    pub changes: Vec<Change>,
}

impl ChangeBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change to the batch.
    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Get the number of changes in the batch.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterate over the changes in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }
}

impl FromIterator<Change> for ChangeBatch {
    fn from_iter<T: IntoIterator<Item = Change>>(iter: T) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChangeBatch {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
