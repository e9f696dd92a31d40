//! Rows: ordered column name/value pairs exchanged with storage backends.

use crate::value::Value;
use rkyv::{Archive, Deserialize, Serialize};

/// A column name and value pair.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct FieldValue {
    /// Column name.
    pub field: String,
    /// Column value.
    pub value: Value,
}

impl FieldValue {
    /// Create a new column-value pair.
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A stored row, or a subset of one when carried by an update.
#[derive(Debug, Clone, PartialEq, Default, Archive, Serialize, Deserialize)]
pub struct Row {
    /// Columns in insertion order.
    pub columns: Vec<FieldValue>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column, builder style.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Set a column, replacing any previous value under the same name.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        let value = value.into();
        match self.columns.iter_mut().find(|c| c.field == field) {
            Some(existing) => existing.value = value,
            None => self.columns.push(FieldValue { field, value }),
        }
    }

    /// Get a column value by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.columns.iter().find(|c| c.field == field).map(|c| &c.value)
    }

    /// Overlay another row's columns onto this one.
    pub fn merge(&mut self, other: &Row) {
        for column in &other.columns {
            self.set(column.field.clone(), column.value.clone());
        }
    }

    /// Columns whose value differs from `previous` (or are absent there).
    pub fn diff(&self, previous: &Row) -> Row {
        self.columns
            .iter()
            .filter(|c| previous.get(&c.field) != Some(&c.value))
            .cloned()
            .collect()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if the row carries no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over column name/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|c| (c.field.as_str(), &c.value))
    }
}

impl FromIterator<FieldValue> for Row {
    fn from_iter<T: IntoIterator<Item = FieldValue>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}
