use cascade_types::{ChangeRecord, CommittedChange, ManagedObject, ObjectId};

use crate::error::StoreResult;

/// Transactional object store the `store` session commits into.
///
/// All implementations must satisfy these invariants:
/// - `commit` is atomic: either every record is applied or none is.
/// - Commits are serialized internally; concurrent callers never
///   interleave inside one commit.
/// - An update or delete whose `base_version` differs from the stored
///   version is rejected with `StoreError::Conflict`.
/// - An insert for an identity that already exists is rejected with
///   `StoreError::AlreadyExists`.
/// - Versions returned from `commit` are strictly greater than any version
///   the store handed out before.
pub trait PersistentStore: Send + Sync {
    /// Read the durable state of one object.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    fn fetch(&self, id: &ObjectId) -> StoreResult<Option<ManagedObject>>;

    /// Apply a batch of change records and return the committed state of
    /// every touched object, in input order.
    fn commit(&self, changes: &[ChangeRecord]) -> StoreResult<Vec<CommittedChange>>;

    /// Number of objects currently stored.
    fn object_count(&self) -> StoreResult<usize>;

    /// Drop every object. Used by destructive lifecycle operations.
    fn reset(&self) -> StoreResult<()>;

    /// Returns `true` if the store holds no objects yet, e.g. before
    /// seeding.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.object_count()? == 0)
    }

    /// Read several objects.
    ///
    /// Default implementation calls `fetch()` for each ID.
    fn fetch_batch(&self, ids: &[ObjectId]) -> StoreResult<Vec<Option<ManagedObject>>> {
        ids.iter().map(|id| self.fetch(id)).collect()
    }
}
