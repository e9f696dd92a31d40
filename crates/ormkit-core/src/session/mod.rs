//! Session layer: identity map, references, collections, and the unit of
//! work that flushes staged changes to a storage backend.

mod cascade;
mod collection;
mod config;
mod entity;
mod flush;
mod identity_map;
mod reference;
mod unit_of_work;

pub use collection::Collection;
pub use config::{SessionConfig, DEFAULT_MAX_CASCADE_DEPTH};
pub use entity::{Entity, EntityData, WeakEntity};
pub use identity_map::IdentityMap;
pub use reference::Reference;
pub use unit_of_work::{FindOptions, PendingChange, SessionState, StagedOp, UnitOfWork};
