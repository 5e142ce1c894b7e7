use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, trace};

use cascade_store::{ObjectModel, PersistentStore};
use cascade_types::{
    Attributes, ChangeKind, ChangeRecord, CommitEvent, CommittedChange, ManagedObject, ObjectId,
    SessionId, SessionRole, ThreadToken, VersionClock,
};

use crate::dispatcher::Dispatcher;
use crate::error::{SessionError, SessionResult};

/// Marks versions the root session exposes for objects it has not
/// touched: the store's own version with this bit set. Clock ticks never
/// reach it.
const DURABLE_VERSION: u64 = 1 << 63;

/// A thread-confined mutation scope.
///
/// A session stages inserts, updates and deletes invisibly until it is
/// saved into its backing: the parent session, or the persistent store for
/// the `store` role. Every mutation must come from the owning thread;
/// anything else fails with [`SessionError::ThreadAffinityViolation`].
///
/// Objects a session has not touched resolve through its parent chain. A
/// materialized object carries the version this session exposes to its
/// children, and the session remembers which version its own backing had
/// when the object was loaded. Saves are checked against the latter.
pub struct Session {
    id: SessionId,
    role: SessionRole,
    dispatcher: Dispatcher,
    parent: Option<Weak<Session>>,
    parent_id: Option<SessionId>,
    backing: Option<Arc<dyn PersistentStore>>,
    model: Arc<ObjectModel>,
    clock: Arc<VersionClock>,
    state: Mutex<SessionState>,
    invalidated: AtomicBool,
    commit_seq: AtomicU64,
}

#[derive(Default)]
struct SessionState {
    objects: HashMap<ObjectId, ManagedObject>,
    /// Version of each materialized object in the backing's namespace.
    upstream: HashMap<ObjectId, u64>,
    /// Attributes of each materialized object as the backing last reported
    /// them. A merged parent commit is compared against these to tell which
    /// attributes the parent changed.
    origins: HashMap<ObjectId, Attributes>,
    changes: BTreeMap<ObjectId, ChangeRecord>,
    /// `None` while undo is disabled.
    undo: Option<Vec<UndoEntry>>,
}

/// Snapshot of one object's slot before a mutation.
struct UndoEntry {
    object: ObjectId,
    before: Option<ManagedObject>,
    change: Option<ChangeRecord>,
    upstream: Option<u64>,
    origin: Option<Attributes>,
}

/// A change checked against the current view, ready to apply.
enum Planned {
    Insert(ChangeRecord),
    Update(ChangeRecord, ManagedObject),
    Delete(ManagedObject),
}

impl SessionState {
    fn stage(&mut self, record: ChangeRecord) {
        let id = record.object;
        let merged = match self.changes.remove(&id) {
            Some(previous) => previous.coalesce(record),
            None => Some(record),
        };
        if let Some(merged) = merged {
            self.changes.insert(id, merged);
        }
    }

    fn remember(&mut self, object: ObjectId) {
        if self.undo.is_none() {
            return;
        }
        let entry = UndoEntry {
            object,
            before: self.objects.get(&object).cloned(),
            change: self.changes.get(&object).cloned(),
            upstream: self.upstream.get(&object).copied(),
            origin: self.origins.get(&object).cloned(),
        };
        if let Some(stack) = self.undo.as_mut() {
            stack.push(entry);
        }
    }

    fn pending_delete(&self, id: &ObjectId) -> bool {
        matches!(self.changes.get(id), Some(r) if r.kind == ChangeKind::Delete)
    }

    /// Record what the backing holds for `id`.
    fn track(&mut self, id: ObjectId, version: u64, attributes: Attributes) {
        self.upstream.insert(id, version);
        self.origins.insert(id, attributes);
    }

    fn untrack(&mut self, id: &ObjectId) {
        self.upstream.remove(id);
        self.origins.remove(id);
    }

    /// Returns `true` if a parent commit carrying `incoming` changed an
    /// attribute the pending update of `id` also changed, to another value.
    fn contested(&self, id: &ObjectId, incoming: &Attributes) -> bool {
        let Some(record) = self.changes.get(id) else {
            return false;
        };
        if record.kind != ChangeKind::Update {
            return false;
        }
        let origin = self.origins.get(id);
        record.dirty.iter().any(|key| {
            let theirs = incoming.get(key);
            theirs != record.values.get(key) && origin.map_or(true, |o| o.get(key) != theirs)
        })
    }

    /// Forget undo entries for `id`; the object is gone upstream.
    fn forget_undo(&mut self, id: &ObjectId) {
        if let Some(stack) = self.undo.as_mut() {
            stack.retain(|entry| entry.object != *id);
        }
    }
}

impl Session {
    /// The `store` session: no parent, saves go to `backing`.
    pub(crate) fn root(
        dispatcher: Dispatcher,
        backing: Arc<dyn PersistentStore>,
        model: Arc<ObjectModel>,
        clock: Arc<VersionClock>,
    ) -> Arc<Self> {
        Self::build(SessionRole::Store, dispatcher, None, Some(backing), model, clock)
    }

    /// A session whose saves go into `parent`.
    pub(crate) fn child(role: SessionRole, dispatcher: Dispatcher, parent: &Arc<Session>) -> Arc<Self> {
        Self::build(
            role,
            dispatcher,
            Some(parent),
            None,
            Arc::clone(&parent.model),
            Arc::clone(&parent.clock),
        )
    }

    fn build(
        role: SessionRole,
        dispatcher: Dispatcher,
        parent: Option<&Arc<Session>>,
        backing: Option<Arc<dyn PersistentStore>>,
        model: Arc<ObjectModel>,
        clock: Arc<VersionClock>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: SessionId::next(),
            role,
            dispatcher,
            parent: parent.map(Arc::downgrade),
            parent_id: parent.map(|p| p.id),
            backing,
            model,
            clock,
            state: Mutex::new(SessionState::default()),
            invalidated: AtomicBool::new(false),
            commit_seq: AtomicU64::new(0),
        });
        debug!(
            session = %session.id,
            role = %session.role,
            thread = %session.dispatcher.name(),
            parent = ?session.parent_id,
            "session created"
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Dispatcher of the owning thread.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn owner(&self) -> ThreadToken {
        self.dispatcher.token()
    }

    /// The parent session, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Session>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_id(&self) -> Option<SessionId> {
        self.parent_id
    }

    /// Returns `true` for the session wired straight to the persistent store.
    pub fn is_root(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Set the initial undo mode before the session is handed out.
    pub(crate) fn init_undo(&self, enabled: bool) {
        self.lock_state().undo = enabled.then(Vec::new);
    }

    pub(crate) fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, role = %self.role, "session invalidated");
        }
    }

    /// Number of successful non-empty saves so far.
    pub fn commit_count(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// This session followed by its ancestors, ending at the root.
    pub fn ancestry(self: &Arc<Self>, max_depth: usize) -> SessionResult<Vec<Arc<Session>>> {
        let mut chain = vec![Arc::clone(self)];
        loop {
            let current = &chain[chain.len() - 1];
            if current.is_root() {
                return Ok(chain);
            }
            if chain.len() >= max_depth {
                return Err(SessionError::ParentCycle {
                    session: self.id,
                    max_depth,
                });
            }
            let parent = current
                .parent()
                .ok_or(SessionError::UnknownParent(current.id))?;
            chain.push(parent);
        }
    }

    // ---- Object operations (owning thread only) ----

    /// Stage a new object and return its identity.
    pub fn insert(&self, entity: impl Into<String>, attributes: Attributes) -> SessionResult<ObjectId> {
        self.ensure_owner("insert")?;
        let object = ManagedObject::new(ObjectId::new(), entity, attributes, self.clock.tick());
        let id = object.id;

        let mut state = self.lock_state();
        state.remember(id);
        state.stage(ChangeRecord::insert(&object));
        state.objects.insert(id, object);
        trace!(session = %self.id, object = %id, "insert staged");
        Ok(id)
    }

    /// Overwrite attributes of an object. Values equal to the current ones
    /// are not recorded as changes.
    pub fn update(&self, id: ObjectId, attributes: Attributes) -> SessionResult<()> {
        self.ensure_owner("update")?;
        let mut object = self
            .materialize(&id)?
            .ok_or(SessionError::ObjectNotFound(id))?;
        let dirty = object.apply(&attributes);
        if dirty.is_empty() {
            return Ok(());
        }
        object.version = self.clock.tick();

        let mut state = self.lock_state();
        state.remember(id);
        let base = state.upstream.get(&id).copied();
        state.stage(ChangeRecord::update(&object, dirty, base));
        state.objects.insert(id, object);
        trace!(session = %self.id, object = %id, "update staged");
        Ok(())
    }

    /// Stage deletion of an object.
    pub fn delete(&self, id: ObjectId) -> SessionResult<()> {
        self.ensure_owner("delete")?;
        let object = self
            .materialize(&id)?
            .ok_or(SessionError::ObjectNotFound(id))?;

        let mut state = self.lock_state();
        state.remember(id);
        let base = state.upstream.get(&id).copied();
        state.objects.remove(&id);
        state.stage(ChangeRecord::delete(&object, base));
        trace!(session = %self.id, object = %id, "delete staged");
        Ok(())
    }

    /// Resolve an object through this session and its ancestors, caching
    /// it in this session.
    pub fn object(&self, id: ObjectId) -> SessionResult<Option<ManagedObject>> {
        self.ensure_owner("object")?;
        self.materialize(&id)
    }

    /// Drop every pending change. Touched objects resolve through the
    /// parent again afterwards. Returns how many changes were dropped.
    pub fn discard(&self) -> SessionResult<usize> {
        self.ensure_owner("discard")?;
        let mut state = self.lock_state();
        let changes = std::mem::take(&mut state.changes);
        for id in changes.keys() {
            state.objects.remove(id);
            state.untrack(id);
        }
        if let Some(stack) = state.undo.as_mut() {
            stack.clear();
        }
        debug!(session = %self.id, dropped = changes.len(), "pending changes discarded");
        Ok(changes.len())
    }

    pub fn set_undo_enabled(&self, enabled: bool) -> SessionResult<()> {
        self.ensure_owner("set_undo_enabled")?;
        let mut state = self.lock_state();
        match (enabled, state.undo.is_some()) {
            (true, false) => state.undo = Some(Vec::new()),
            (false, true) => state.undo = None,
            _ => {}
        }
        Ok(())
    }

    pub fn is_undo_enabled(&self) -> bool {
        self.lock_state().undo.is_some()
    }

    pub fn can_undo(&self) -> bool {
        self.lock_state().undo.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Revert the most recent mutation. Returns `false` if there was
    /// nothing to undo or undo is disabled.
    pub fn undo(&self) -> SessionResult<bool> {
        self.ensure_owner("undo")?;
        let mut state = self.lock_state();
        let Some(entry) = state.undo.as_mut().and_then(Vec::pop) else {
            return Ok(false);
        };
        let id = entry.object;
        match entry.before {
            Some(object) => state.objects.insert(id, object),
            None => state.objects.remove(&id),
        };
        match entry.change {
            Some(change) => state.changes.insert(id, change),
            None => state.changes.remove(&id),
        };
        match entry.upstream {
            Some(version) => state.upstream.insert(id, version),
            None => state.upstream.remove(&id),
        };
        match entry.origin {
            Some(attributes) => state.origins.insert(id, attributes),
            None => state.origins.remove(&id),
        };
        trace!(session = %self.id, object = %id, "mutation undone");
        Ok(true)
    }

    // ---- Inspection (any thread) ----

    pub fn has_changes(&self) -> bool {
        !self.lock_state().changes.is_empty()
    }

    /// Pending change records, ordered by object id.
    pub fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.lock_state().changes.values().cloned().collect()
    }

    /// Objects currently materialized in this session, ordered by id.
    pub fn registered_objects(&self) -> Vec<ManagedObject> {
        let state = self.lock_state();
        let mut objects: Vec<ManagedObject> = state.objects.values().cloned().collect();
        objects.sort_by_key(|o| o.id);
        objects
    }

    // ---- Save and merge internals ----

    /// This session's view of an object, without caching it here.
    ///
    /// Safe from any thread. Objects the root has not touched come straight
    /// from the store under a version derived from the store's, so reads
    /// leave nothing behind and the version stays stable between them.
    pub(crate) fn resolve(&self, id: &ObjectId) -> SessionResult<Option<ManagedObject>> {
        {
            let state = self.lock_state();
            if let Some(object) = state.objects.get(id) {
                return Ok(Some(object.clone()));
            }
            if state.pending_delete(id) {
                return Ok(None);
            }
            if let Some(backing) = &self.backing {
                return Ok(backing.fetch(id)?.map(|mut durable| {
                    durable.version |= DURABLE_VERSION;
                    durable
                }));
            }
        }
        let parent = self.parent().ok_or(SessionError::UnknownParent(self.id))?;
        parent.resolve(id)
    }

    /// The backing's version for an object this session resolved but has
    /// not cached.
    fn backing_version(&self, resolved: u64) -> u64 {
        if self.is_root() {
            resolved & !DURABLE_VERSION
        } else {
            resolved
        }
    }

    /// Resolve an object and cache it in this session.
    fn materialize(&self, id: &ObjectId) -> SessionResult<Option<ManagedObject>> {
        let Some(object) = self.resolve(id)? else {
            return Ok(None);
        };
        let mut state = self.lock_state();
        if !state.objects.contains_key(id) {
            let version = self.backing_version(object.version);
            state.track(*id, version, object.attributes.clone());
            state.objects.insert(*id, object.clone());
        }
        Ok(state.objects.get(id).cloned())
    }

    /// Apply a child's saved changes as pending changes of this session.
    ///
    /// Runs on this session's thread. Every record is checked before any is
    /// applied; returns the new version of each record in input order.
    pub(crate) fn absorb(&self, records: Vec<ChangeRecord>, from: SessionId) -> SessionResult<Vec<u64>> {
        self.ensure_owner("absorb")?;

        let mut plan = Vec::with_capacity(records.len());
        for record in records {
            let current = self.resolve(&record.object)?;
            let planned = match (record.kind, current) {
                (ChangeKind::Insert, None) => Planned::Insert(record),
                (ChangeKind::Insert, Some(_)) => {
                    return Err(SessionError::ObjectExists(record.object));
                }
                (kind, Some(current)) if Some(current.version) == record.base_version => {
                    if kind == ChangeKind::Update {
                        Planned::Update(record, current)
                    } else {
                        Planned::Delete(current)
                    }
                }
                (_, current) => {
                    return Err(SessionError::Conflict {
                        object: record.object,
                        expected: record.base_version,
                        found: current.map(|o| o.version),
                    });
                }
            };
            plan.push(planned);
        }

        let mut state = self.lock_state();
        let mut versions = Vec::with_capacity(plan.len());
        for planned in plan {
            let version = self.clock.tick();
            match planned {
                Planned::Insert(record) => {
                    let object =
                        ManagedObject::new(record.object, record.entity, record.values, version);
                    state.stage(ChangeRecord::insert(&object));
                    state.objects.insert(object.id, object);
                }
                Planned::Update(record, mut object) => {
                    let id = object.id;
                    if !state.objects.contains_key(&id) {
                        let upstream = self.backing_version(object.version);
                        state.track(id, upstream, object.attributes.clone());
                    }
                    for key in &record.dirty {
                        match record.values.get(key) {
                            Some(value) => object.attributes.insert(key.clone(), value.clone()),
                            None => object.attributes.remove(key),
                        };
                    }
                    object.version = version;
                    let base = state.upstream.get(&id).copied();
                    state.stage(ChangeRecord::update(&object, record.dirty, base));
                    state.objects.insert(id, object);
                }
                Planned::Delete(object) => {
                    let id = object.id;
                    if !state.objects.contains_key(&id) {
                        let upstream = self.backing_version(object.version);
                        state.track(id, upstream, object.attributes.clone());
                    }
                    let base = state.upstream.get(&id).copied();
                    state.objects.remove(&id);
                    state.stage(ChangeRecord::delete(&object, base));
                }
            }
            versions.push(version);
        }
        debug!(session = %self.id, from = %from, records = versions.len(), "child changes absorbed");
        Ok(versions)
    }

    /// Save pending changes into the backing.
    ///
    /// Runs on this session's thread. Returns `None` when there was nothing
    /// to save. On failure nothing changes on either side.
    pub(crate) fn commit(&self) -> SessionResult<Option<CommitEvent>> {
        self.ensure_owner("save")?;
        let records = self.pending_changes();
        if records.is_empty() {
            return Ok(None);
        }
        for record in &records {
            self.model
                .validate(record)
                .map_err(|source| SessionError::Validation {
                    object: record.object,
                    source,
                })?;
        }

        let versions: Vec<u64> = match &self.backing {
            Some(backing) => backing
                .commit(&records)?
                .into_iter()
                .map(|c| c.version)
                .collect(),
            None => {
                let parent = self.parent().ok_or(SessionError::UnknownParent(self.id))?;
                let target = Arc::clone(&parent);
                let batch = records.clone();
                let from = self.id;
                parent
                    .dispatcher
                    .perform_and_wait(move || target.absorb(batch, from))??
            }
        };

        let mut state = self.lock_state();
        let mut changes = Vec::with_capacity(records.len());
        for (record, version) in records.into_iter().zip(versions) {
            let id = record.object;
            // Jobs serviced while waiting on the parent may have staged
            // newer changes; those stay pending.
            let unchanged = state
                .changes
                .get(&id)
                .is_some_and(|c| c.kind == record.kind && c.values == record.values);
            if unchanged {
                state.changes.remove(&id);
            }
            if record.kind == ChangeKind::Delete {
                state.untrack(&id);
                changes.push(CommittedChange {
                    object: id,
                    entity: record.entity,
                    kind: record.kind,
                    attributes: Attributes::new(),
                    version: self.clock.tick(),
                });
                continue;
            }
            let (attributes, exposed) = match state.objects.get(&id) {
                Some(object) => (object.attributes.clone(), object.version),
                None => (record.values.clone(), self.clock.tick()),
            };
            // Newer local edits are not in the backing yet.
            let saved = if unchanged { attributes.clone() } else { record.values };
            state.track(id, version, saved);
            changes.push(CommittedChange {
                object: id,
                entity: record.entity,
                kind: record.kind,
                attributes,
                version: exposed,
            });
        }
        if let Some(stack) = state.undo.as_mut() {
            stack.clear();
        }
        drop(state);

        let sequence = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            session = %self.id,
            role = %self.role,
            sequence,
            changes = changes.len(),
            "session saved"
        );
        Ok(Some(CommitEvent {
            source: self.id,
            source_role: self.role,
            sequence,
            changes,
        }))
    }

    /// Fold another session's commit into this one.
    ///
    /// Attributes this session has dirtied keep their local value. Deletes
    /// drop the object, any pending change to it and its undo history.
    /// When the event comes from the parent, its versions become the new
    /// base for later saves, except for pending updates the parent
    /// contested: those keep their old base so the next save conflicts.
    /// Returns how many objects changed.
    pub(crate) fn merge(&self, event: &CommitEvent) -> SessionResult<usize> {
        self.ensure_owner("merge")?;
        let from_parent = self.parent_id == Some(event.source);
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let mut touched = 0;

        for change in &event.changes {
            let id = change.object;
            if change.kind == ChangeKind::Delete {
                let had_object = state.objects.remove(&id).is_some();
                let had_change = state.changes.remove(&id).is_some();
                state.untrack(&id);
                state.forget_undo(&id);
                if had_object || had_change {
                    touched += 1;
                }
                continue;
            }
            if state.pending_delete(&id) {
                continue;
            }
            let contested = from_parent && state.contested(&id, &change.attributes);

            let local = state.changes.get(&id);
            let pending = local.is_some();
            let dirty = local.map(|r| r.dirty.clone()).unwrap_or_default();

            match state.objects.get_mut(&id) {
                Some(object) => {
                    let incoming: Attributes = change
                        .attributes
                        .iter()
                        .filter(|(key, _)| !dirty.contains(*key))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let changed = !object.apply(&incoming).is_empty();
                    if from_parent && !pending {
                        object.version = change.version;
                    } else if changed {
                        object.version = self.clock.tick();
                    }
                    if changed {
                        touched += 1;
                    }
                }
                None if change.kind == ChangeKind::Insert => {
                    let version = if from_parent {
                        change.version
                    } else {
                        self.clock.tick()
                    };
                    let object =
                        ManagedObject::new(id, change.entity.clone(), change.attributes.clone(), version);
                    state.objects.insert(id, object);
                    touched += 1;
                }
                None => {}
            }

            if from_parent && state.objects.contains_key(&id) {
                if contested {
                    debug!(
                        session = %self.id,
                        object = %id,
                        source = %event.source,
                        "parent commit contests a pending update"
                    );
                    continue;
                }
                state.track(id, change.version, change.attributes.clone());
                if let Some(record) = state.changes.get_mut(&id) {
                    if record.kind != ChangeKind::Insert {
                        record.base_version = Some(change.version);
                    }
                }
            }
        }

        trace!(
            session = %self.id,
            source = %event.source,
            sequence = event.sequence,
            touched,
            "commit merged"
        );
        Ok(touched)
    }

    fn ensure_owner(&self, operation: &'static str) -> SessionResult<()> {
        if self.is_invalidated() {
            return Err(SessionError::SessionInvalidated(self.id));
        }
        let caller = ThreadToken::current();
        if caller != self.owner() {
            error!(
                session = %self.id,
                role = %self.role,
                owner = %self.owner(),
                caller = %caller,
                operation,
                "session used off its owning thread"
            );
            return Err(SessionError::ThreadAffinityViolation {
                session: self.id,
                owner: self.owner(),
                caller,
                operation,
            });
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session lock poisoned")
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("thread", &self.dispatcher.name())
            .field("parent", &self.parent_id)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
