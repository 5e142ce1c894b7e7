use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use cascade_types::{
    Attributes, ChangeKind, ChangeRecord, CommittedChange, ManagedObject, ObjectId,
};

use crate::error::{ModelError, StoreError, StoreResult};
use crate::traits::PersistentStore;

/// In-memory, HashMap-based persistent store.
///
/// Intended for tests and embedding. A single `Mutex` serializes commits,
/// so batches from independent session chains never interleave. Versions
/// come from a per-store counter.
pub struct InMemoryPersistentStore {
    state: Mutex<StoreState>,
    read_only: AtomicBool,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<ObjectId, ManagedObject>,
    last_version: u64,
    commits: u64,
}

impl InMemoryPersistentStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            read_only: AtomicBool::new(false),
        }
    }

    /// Reject every subsequent commit with `StoreError::ReadOnly`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().expect("lock poisoned").commits
    }

    /// Every stored object, sorted by id.
    pub fn all_objects(&self) -> Vec<ManagedObject> {
        let state = self.state.lock().expect("lock poisoned");
        let mut objects: Vec<ManagedObject> = state.objects.values().cloned().collect();
        objects.sort_by_key(|o| o.id);
        objects
    }

    fn check(state: &StoreState, record: &ChangeRecord) -> StoreResult<()> {
        let existing = state.objects.get(&record.object);
        match record.kind {
            ChangeKind::Insert => {
                if existing.is_some() {
                    return Err(StoreError::AlreadyExists(record.object));
                }
            }
            ChangeKind::Update | ChangeKind::Delete => {
                let found = existing.map(|o| o.version);
                if found.is_none() || found != record.base_version {
                    return Err(StoreError::Conflict {
                        object: record.object,
                        expected: record.base_version,
                        found,
                    });
                }
                if let Some(current) = existing {
                    if current.entity != record.entity {
                        return Err(StoreError::Invalid {
                            object: record.object,
                            source: ModelError::EntityChanged {
                                object: record.object,
                                from: current.entity.clone(),
                                to: record.entity.clone(),
                            },
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(state: &mut StoreState, record: &ChangeRecord) -> CommittedChange {
        state.last_version += 1;
        let version = state.last_version;

        let attributes = match record.kind {
            ChangeKind::Insert => {
                let object = ManagedObject::new(
                    record.object,
                    record.entity.clone(),
                    record.values.clone(),
                    version,
                );
                state.objects.insert(record.object, object);
                record.values.clone()
            }
            ChangeKind::Update => {
                let object = state
                    .objects
                    .entry(record.object)
                    .or_insert_with(|| {
                        ManagedObject::new(record.object, record.entity.clone(), Attributes::new(), 0)
                    });
                for key in &record.dirty {
                    match record.values.get(key) {
                        Some(value) => {
                            object.attributes.insert(key.clone(), value.clone());
                        }
                        None => {
                            object.attributes.remove(key);
                        }
                    }
                }
                object.version = version;
                object.attributes.clone()
            }
            ChangeKind::Delete => {
                state.objects.remove(&record.object);
                Attributes::new()
            }
        };

        CommittedChange {
            object: record.object,
            entity: record.entity.clone(),
            kind: record.kind,
            attributes,
            version,
        }
    }
}

impl Default for InMemoryPersistentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for InMemoryPersistentStore {
    fn fetch(&self, id: &ObjectId) -> StoreResult<Option<ManagedObject>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.objects.get(id).cloned())
    }

    fn commit(&self, changes: &[ChangeRecord]) -> StoreResult<Vec<CommittedChange>> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;

        // Check everything before touching anything: commits are atomic.
        for record in changes {
            Self::check(&state, record)?;
        }

        let committed: Vec<CommittedChange> = changes
            .iter()
            .map(|record| Self::apply(&mut state, record))
            .collect();
        state.commits += 1;

        debug!(
            records = committed.len(),
            commit = state.commits,
            version = state.last_version,
            "store commit applied"
        );
        Ok(committed)
    }

    fn object_count(&self) -> StoreResult<usize> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.objects.len())
    }

    fn reset(&self) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        state.objects.clear();
        debug!("store reset");
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryPersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.object_count().unwrap_or_default();
        f.debug_struct("InMemoryPersistentStore")
            .field("object_count", &count)
            .field("read_only", &self.read_only.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn user(name: &str) -> ManagedObject {
        let mut attributes = Attributes::new();
        attributes.insert("name".into(), json!(name));
        ManagedObject::new(ObjectId::new(), "User", attributes, 0)
    }

    fn insert(store: &InMemoryPersistentStore, name: &str) -> ManagedObject {
        let obj = user(name);
        let committed = store.commit(&[ChangeRecord::insert(&obj)]).unwrap();
        store.fetch(&committed[0].object).unwrap().expect("should exist")
    }

    fn rename(obj: &ManagedObject, name: &str, base: Option<u64>) -> ChangeRecord {
        let mut changed = obj.clone();
        let mut values = Attributes::new();
        values.insert("name".into(), json!(name));
        let dirty = changed.apply(&values);
        ChangeRecord::update(&changed, dirty, base)
    }

    // -----------------------------------------------------------------------
    // Commit and fetch
    // -----------------------------------------------------------------------

    #[test]
    fn insert_then_fetch() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");
        assert_eq!(stored.get("name"), Some(&json!("ada")));
        assert_eq!(stored.version, 1);
        assert_eq!(store.object_count().unwrap(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn update_with_matching_base_applies() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");

        let committed = store
            .commit(&[rename(&stored, "grace", Some(stored.version))])
            .unwrap();
        assert_eq!(committed[0].kind, ChangeKind::Update);
        assert!(committed[0].version > stored.version);

        let after = store.fetch(&stored.id).unwrap().unwrap();
        assert_eq!(after.get("name"), Some(&json!("grace")));
        assert_eq!(after.version, committed[0].version);
    }

    #[test]
    fn delete_removes_object() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");
        store
            .commit(&[ChangeRecord::delete(&stored, Some(stored.version))])
            .unwrap();
        assert!(store.fetch(&stored.id).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    #[test]
    fn stale_update_conflicts() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");
        store
            .commit(&[rename(&stored, "grace", Some(stored.version))])
            .unwrap();

        let err = store
            .commit(&[rename(&stored, "hopper", Some(stored.version))])
            .unwrap_err();
        match err {
            StoreError::Conflict {
                object,
                expected,
                found,
            } => {
                assert_eq!(object, stored.id);
                assert_eq!(expected, Some(stored.version));
                assert!(found > expected);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The first writer's value survives.
        let after = store.fetch(&stored.id).unwrap().unwrap();
        assert_eq!(after.get("name"), Some(&json!("grace")));
    }

    #[test]
    fn update_of_missing_object_conflicts() {
        let store = InMemoryPersistentStore::new();
        let err = store.commit(&[rename(&user("ghost"), "x", Some(1))]).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: None, .. }));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryPersistentStore::new();
        let obj = user("ada");
        store.commit(&[ChangeRecord::insert(&obj)]).unwrap();
        let err = store.commit(&[ChangeRecord::insert(&obj)]).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == obj.id));
    }

    #[test]
    fn entity_change_is_rejected() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");
        let mut record = ChangeRecord::update(&stored, BTreeSet::new(), Some(stored.version));
        record.entity = "Group".into();
        let err = store.commit(&[record]).unwrap_err();
        assert!(matches!(err, StoreError::Invalid { .. }));
    }

    #[test]
    fn failed_batch_applies_nothing() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");
        let fresh = user("new");

        let batch = vec![
            ChangeRecord::insert(&fresh),
            rename(&stored, "grace", Some(stored.version + 10)),
        ];
        assert!(store.commit(&batch).is_err());
        assert!(store.fetch(&fresh.id).unwrap().is_none());
        assert_eq!(store.commit_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn read_only_rejects_commits() {
        let store = InMemoryPersistentStore::new();
        store.set_read_only(true);
        let err = store.commit(&[ChangeRecord::insert(&user("ada"))]).unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));

        store.set_read_only(false);
        assert!(store.commit(&[ChangeRecord::insert(&user("ada"))]).is_ok());
    }

    #[test]
    fn reset_empties_store_but_keeps_versions_moving() {
        let store = InMemoryPersistentStore::new();
        let first = insert(&store, "ada");
        store.reset().unwrap();
        assert!(store.is_empty().unwrap());

        let second = insert(&store, "grace");
        assert!(second.version > first.version);
    }

    #[test]
    fn fetch_batch_reports_missing() {
        let store = InMemoryPersistentStore::new();
        let stored = insert(&store, "ada");
        let results = store.fetch_batch(&[stored.id, ObjectId::new()]).unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn concurrent_commits_are_serialized() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryPersistentStore::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for n in 0..25 {
                        let obj = user(&format!("{i}-{n}"));
                        store.commit(&[ChangeRecord::insert(&obj)]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }

        assert_eq!(store.object_count().unwrap(), 100);
        assert_eq!(store.commit_count(), 100);
        let mut versions: Vec<u64> = store.all_objects().iter().map(|o| o.version).collect();
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), 100);
    }

    #[test]
    fn debug_format() {
        let store = InMemoryPersistentStore::new();
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryPersistentStore"));
        assert!(debug.contains("object_count"));
    }
}
