//! Persistent store boundary for Cascade.
//!
//! The `store` session is the only session that talks to a
//! [`PersistentStore`]. Everything above it works on in-memory views and
//! hands change records down the parent chain until they reach this
//! boundary.
//!
//! # Storage Backends
//!
//! All backends implement the [`PersistentStore`] trait:
//!
//! - [`InMemoryPersistentStore`] -- `HashMap`-based store for tests and embedding
//!
//! # Object Model
//!
//! [`ObjectModel`] describes entities and their attributes. Sessions
//! validate every pending change against it before handing the change to
//! their backing.
//!
//! # Design Rules
//!
//! 1. Commits are atomic: a batch is fully checked before anything is applied.
//! 2. Commits are serialized; independent session chains never interleave.
//! 3. Optimistic concurrency: updates and deletes carry the version they were based on.
//! 4. The store never assigns identities; inserts arrive with their `ObjectId`.

pub mod error;
pub mod memory;
pub mod model;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{ModelError, StoreError, StoreResult};
pub use memory::InMemoryPersistentStore;
pub use model::{AttributeDescription, AttributeKind, EntityDescription, ObjectModel};
pub use traits::PersistentStore;
