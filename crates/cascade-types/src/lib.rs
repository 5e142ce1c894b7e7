//! Foundation types for Cascade.
//!
//! Identities, roles, change records and commit events shared by the store
//! boundary and the session layer. Every other Cascade crate depends on
//! `cascade-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- identity of a persistent object (UUID v7)
//! - [`SessionId`] -- opaque session handle
//! - [`ThreadToken`] -- opaque identity of the thread that owns a session
//! - [`SessionRole`] -- `Main`, `Background`, `Store` or `Scratch`
//! - [`ChangeRecord`] -- a pending insert/update/delete
//! - [`CommitEvent`] -- the change set announced after a successful save
//! - [`VersionClock`] -- monotonic source of object versions

pub mod change;
pub mod clock;
pub mod error;
pub mod event;
pub mod identity;
pub mod role;

pub use change::{Attributes, ChangeKind, ChangeRecord, ManagedObject};
pub use clock::VersionClock;
pub use error::TypeError;
pub use event::{CommitEvent, CommittedChange};
pub use identity::{ObjectId, SessionId, ThreadToken};
pub use role::SessionRole;
