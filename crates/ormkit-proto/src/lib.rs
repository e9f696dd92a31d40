//! ormkit protocol types.
//!
//! This crate defines the values, keys, rows, and change batches that flow
//! between the ormkit session core and a storage backend.
//!
//! # Modules
//!
//! - [`value`] - Runtime scalar values held by entity fields
//! - [`key`] - Primary key components and their byte encoding
//! - [`row`] - Column name/value rows
//! - [`change`] - Insert/update/delete records and ordered batches
//! - [`error`] - Protocol error types
//!
//! Values and rows derive `rkyv::Archive`, `rkyv::Serialize`, and
//! `rkyv::Deserialize` so backends can store them directly.

pub mod change;
pub mod error;
pub mod key;
pub mod row;
pub mod value;

pub use error::Error;

// Re-export commonly used types at crate root
pub use change::{Change, ChangeBatch};
pub use key::{KeyValue, PrimaryKey};
pub use row::{FieldValue, Row};
pub use value::Value;
