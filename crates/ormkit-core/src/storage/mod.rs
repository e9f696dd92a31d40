//! Storage layer.
//!
//! The session talks to storage through the [`StorageBackend`] trait. The
//! bundled [`SledBackend`] keeps rows in a sled database.

mod backend;
mod config;
mod record;
mod sled_backend;

pub use backend::{BackendError, RelatedRequest, StorageBackend};
pub use config::{StorageConfig, DEFAULT_CACHE_CAPACITY, DEFAULT_FLUSH_EVERY_MS};
pub use record::StoredRow;
pub use sled_backend::SledBackend;
