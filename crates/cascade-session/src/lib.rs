//! Thread-confined session hierarchy for Cascade.
//!
//! Sessions stage changes invisibly and save them one level up their
//! parent chain: `main -> background -> store -> persistent store`. Every
//! session belongs to exactly one thread and is only mutated there; work
//! for another thread's session goes through that thread's [`Dispatcher`].
//!
//! # Components
//!
//! - [`Cascade`] -- entry point tying the pieces below together
//! - [`SessionRegistry`] -- one session per thread, created on first access
//! - [`SessionHierarchy`] -- canonical `main`/`background`/`store` wiring and scratch sessions
//! - [`SaveCoordinator`] -- single-hop, cascading and asynchronous cascading saves
//! - [`MergeBus`] -- delivers commit events to subscribed sessions on their own threads
//! - [`LifecycleManager`] -- tears down and rebuilds the hierarchy
//!
//! # Guarantees
//!
//! 1. At most one live session per thread.
//! 2. Parent chains are acyclic and end at `store`.
//! 3. A session is only mutated from its owning thread; violations fail fast.
//! 4. A save is durable only once every ancestor up to `store` has saved.
//! 5. Commit events go out only after the originating save fully succeeded,
//!    and in commit order per source.

pub mod cascade;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod hierarchy;
pub mod lifecycle;
pub mod merge;
pub mod registry;
pub mod session;

pub use cascade::Cascade;
pub use config::HierarchyConfig;
pub use coordinator::{CascadeCallback, CascadeFuture, CascadeReport, HopReport, SaveCoordinator};
pub use dispatcher::{Dispatcher, RunLoop, WorkerThread};
pub use error::{SessionError, SessionResult};
pub use hierarchy::{HierarchyDispatchers, SessionHierarchy};
pub use lifecycle::LifecycleManager;
pub use merge::{HeldEvent, MergeBus, MergeHook};
pub use registry::SessionRegistry;
pub use session::Session;

// Re-export key types
pub use cascade_store::{
    AttributeKind, EntityDescription, InMemoryPersistentStore, ObjectModel, PersistentStore,
};
pub use cascade_types::{
    Attributes, ChangeKind, ChangeRecord, CommitEvent, CommittedChange, ManagedObject, ObjectId,
    SessionId, SessionRole, ThreadToken,
};
