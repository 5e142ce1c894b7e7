use std::sync::Arc;

use tracing::{debug, info};

use cascade_store::{ObjectModel, PersistentStore};
use cascade_types::{SessionRole, VersionClock};

use crate::config::HierarchyConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{SessionError, SessionResult};
use crate::merge::MergeBus;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// The threads the canonical sessions live on.
#[derive(Clone, Debug)]
pub struct HierarchyDispatchers {
    pub main: Dispatcher,
    pub background: Dispatcher,
    pub store: Dispatcher,
}

/// Everything needed to build a hierarchy, kept so it can be rebuilt.
pub(crate) struct Blueprint {
    pub config: HierarchyConfig,
    pub dispatchers: HierarchyDispatchers,
    pub store: Arc<dyn PersistentStore>,
    pub model: Arc<ObjectModel>,
    pub clock: Arc<VersionClock>,
}

/// The canonical `main -> background -> store` chain.
///
/// Owns the canonical sessions; parents are only weakly referenced by their
/// children, so dropping a hierarchy drops the whole chain.
pub struct SessionHierarchy {
    main: Arc<Session>,
    background: Arc<Session>,
    store: Arc<Session>,
    registry: Arc<SessionRegistry>,
    max_depth: usize,
}

impl SessionHierarchy {
    /// Build the canonical sessions and register them.
    pub(crate) fn build(
        blueprint: &Blueprint,
        registry: &Arc<SessionRegistry>,
        bus: &MergeBus,
    ) -> SessionResult<Self> {
        let dispatchers = &blueprint.dispatchers;
        let store = Session::root(
            dispatchers.store.clone(),
            Arc::clone(&blueprint.store),
            Arc::clone(&blueprint.model),
            Arc::clone(&blueprint.clock),
        );
        let background = Session::child(SessionRole::Background, dispatchers.background.clone(), &store);
        let main = Session::child(SessionRole::Main, dispatchers.main.clone(), &background);
        main.init_undo(blueprint.config.main_undo_enabled);

        for session in [&store, &background, &main] {
            registry.register(Arc::clone(session))?;
        }
        if blueprint.config.merge_main_from_background {
            bus.subscribe(&main, &background)?;
        }

        info!(
            main = %main.id(),
            background = %background.id(),
            store = %store.id(),
            "session hierarchy built"
        );
        Ok(Self {
            main,
            background,
            store,
            registry: Arc::clone(registry),
            max_depth: blueprint.config.max_chain_depth,
        })
    }

    pub fn main(&self) -> &Arc<Session> {
        &self.main
    }

    pub fn background(&self) -> &Arc<Session> {
        &self.background
    }

    pub fn store(&self) -> &Arc<Session> {
        &self.store
    }

    /// The canonical session for `role`; `None` for `Scratch`.
    pub fn session(&self, role: SessionRole) -> Option<&Arc<Session>> {
        match role {
            SessionRole::Main => Some(&self.main),
            SessionRole::Background => Some(&self.background),
            SessionRole::Store => Some(&self.store),
            SessionRole::Scratch => None,
        }
    }

    /// Returns `true` if `session` is live and its parent chain ends at this
    /// hierarchy's `store`.
    pub fn contains(&self, session: &Arc<Session>) -> bool {
        if session.is_invalidated() {
            return false;
        }
        session
            .ancestry(self.max_depth)
            .ok()
            .and_then(|chain| chain.last().cloned())
            .is_some_and(|root| Arc::ptr_eq(&root, &self.store))
    }

    /// Build an ad-hoc session under `parent`, owned by `dispatcher`'s
    /// thread. The parent must belong to this hierarchy and the thread must
    /// not own a session yet.
    pub fn create_scratch_session(
        &self,
        parent: &Arc<Session>,
        dispatcher: Dispatcher,
    ) -> SessionResult<Arc<Session>> {
        if parent.is_invalidated() {
            return Err(SessionError::SessionInvalidated(parent.id()));
        }
        if !self.contains(parent) {
            return Err(SessionError::ForeignParent(parent.id()));
        }
        // The new session adds one hop to the parent's chain.
        parent.ancestry(self.max_depth.saturating_sub(1))?;

        let session = Session::child(SessionRole::Scratch, dispatcher, parent);
        self.registry.register(Arc::clone(&session))?;
        debug!(session = %session.id(), parent = %parent.id(), "scratch session created");
        Ok(session)
    }

    /// The session owned by `dispatcher`'s thread, creating a scratch
    /// session under `background` if the thread has none.
    pub fn session_for(&self, dispatcher: &Dispatcher) -> SessionResult<Arc<Session>> {
        self.registry.session_for(dispatcher, || {
            Ok(Session::child(
                SessionRole::Scratch,
                dispatcher.clone(),
                &self.background,
            ))
        })
    }

    /// Like [`session_for`](Self::session_for), but the thread's session
    /// must have `role`. Canonical roles resolve only on their own thread.
    pub fn session_for_role(&self, dispatcher: &Dispatcher, role: SessionRole) -> SessionResult<Arc<Session>> {
        self.registry.session_for_role(dispatcher, role, || {
            Ok(Session::child(
                SessionRole::Scratch,
                dispatcher.clone(),
                &self.background,
            ))
        })
    }

    pub(crate) fn invalidate(&self) {
        for session in [&self.main, &self.background, &self.store] {
            session.invalidate();
        }
    }
}

impl std::fmt::Debug for SessionHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHierarchy")
            .field("main", &self.main.id())
            .field("background", &self.background.id())
            .field("store", &self.store.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::WorkerThread;
    use cascade_store::InMemoryPersistentStore;

    struct Fixture {
        hierarchy: SessionHierarchy,
        registry: Arc<SessionRegistry>,
        bus: MergeBus,
        _workers: Vec<WorkerThread>,
    }

    fn fixture(config: HierarchyConfig) -> Fixture {
        let workers: Vec<WorkerThread> = ["h-main", "h-background", "h-store"]
            .into_iter()
            .map(|name| WorkerThread::spawn(name).unwrap())
            .collect();
        let blueprint = Blueprint {
            config,
            dispatchers: HierarchyDispatchers {
                main: workers[0].dispatcher(),
                background: workers[1].dispatcher(),
                store: workers[2].dispatcher(),
            },
            store: Arc::new(InMemoryPersistentStore::new()),
            model: Arc::new(ObjectModel::new()),
            clock: Arc::new(VersionClock::new()),
        };
        let registry = Arc::new(SessionRegistry::new());
        let bus = MergeBus::new();
        let hierarchy = SessionHierarchy::build(&blueprint, &registry, &bus).unwrap();
        Fixture {
            hierarchy,
            registry,
            bus,
            _workers: workers,
        }
    }

    #[test]
    fn canonical_wiring() {
        let f = fixture(HierarchyConfig::default());
        let h = &f.hierarchy;
        assert_eq!(h.main().role(), SessionRole::Main);
        assert_eq!(h.main().parent_id(), Some(h.background().id()));
        assert_eq!(h.background().parent_id(), Some(h.store().id()));
        assert!(h.store().parent().is_none());
        assert!(h.store().is_root());
        assert_eq!(f.registry.len(), 3);
        assert!(h.session(SessionRole::Scratch).is_none());
    }

    #[test]
    fn every_chain_ends_at_store() {
        let f = fixture(HierarchyConfig::default());
        for role in [SessionRole::Main, SessionRole::Background, SessionRole::Store] {
            let session = f.hierarchy.session(role).unwrap();
            let chain = session.ancestry(16).unwrap();
            assert_eq!(chain.last().unwrap().role(), SessionRole::Store);
            assert!(chain.len() <= 3);
        }
    }

    #[test]
    fn main_subscribes_to_background_by_default() {
        let f = fixture(HierarchyConfig::default());
        assert_eq!(f.bus.subscriber_count(f.hierarchy.background().id()), 1);

        let quiet = fixture(HierarchyConfig {
            merge_main_from_background: false,
            ..Default::default()
        });
        assert_eq!(quiet.bus.subscriber_count(quiet.hierarchy.background().id()), 0);
    }

    #[test]
    fn main_undo_follows_config() {
        let f = fixture(HierarchyConfig {
            main_undo_enabled: true,
            ..Default::default()
        });
        assert!(f.hierarchy.main().is_undo_enabled());
        assert!(!f.hierarchy.background().is_undo_enabled());
    }

    #[test]
    fn scratch_session_under_main() {
        let f = fixture(HierarchyConfig::default());
        let worker = WorkerThread::spawn("h-scratch").unwrap();
        let scratch = f
            .hierarchy
            .create_scratch_session(f.hierarchy.main(), worker.dispatcher())
            .unwrap();
        assert_eq!(scratch.role(), SessionRole::Scratch);
        assert_eq!(scratch.parent_id(), Some(f.hierarchy.main().id()));
        assert!(f.hierarchy.contains(&scratch));
        assert_eq!(scratch.ancestry(16).unwrap().len(), 4);

        // A second session on the same thread is refused.
        assert!(matches!(
            f.hierarchy
                .create_scratch_session(f.hierarchy.store(), worker.dispatcher()),
            Err(SessionError::ThreadOccupied(_))
        ));
    }

    #[test]
    fn scratch_parent_must_belong_to_hierarchy() {
        let f = fixture(HierarchyConfig::default());
        let other = fixture(HierarchyConfig::default());
        let worker = WorkerThread::spawn("h-foreign").unwrap();
        assert!(matches!(
            f.hierarchy
                .create_scratch_session(other.hierarchy.background(), worker.dispatcher()),
            Err(SessionError::ForeignParent(_))
        ));
    }

    #[test]
    fn scratch_parent_must_be_live() {
        let f = fixture(HierarchyConfig::default());
        f.hierarchy.invalidate();
        let worker = WorkerThread::spawn("h-late").unwrap();
        assert!(matches!(
            f.hierarchy
                .create_scratch_session(f.hierarchy.background(), worker.dispatcher()),
            Err(SessionError::SessionInvalidated(_))
        ));
    }

    #[test]
    fn scratch_depth_is_bounded() {
        let f = fixture(HierarchyConfig {
            max_chain_depth: 3,
            ..Default::default()
        });
        let worker = WorkerThread::spawn("h-deep").unwrap();
        assert!(matches!(
            f.hierarchy
                .create_scratch_session(f.hierarchy.main(), worker.dispatcher()),
            Err(SessionError::ParentCycle { .. })
        ));
    }

    #[test]
    fn session_for_resolves_by_thread() {
        let f = fixture(HierarchyConfig::default());
        let worker = WorkerThread::spawn("h-any").unwrap();

        let first = f.hierarchy.session_for(&worker.dispatcher()).unwrap();
        let again = f.hierarchy.session_for(&worker.dispatcher()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.role(), SessionRole::Scratch);
        assert_eq!(first.parent_id(), Some(f.hierarchy.background().id()));

        let main = f.hierarchy.session_for(f.hierarchy.main().dispatcher()).unwrap();
        assert!(Arc::ptr_eq(&main, f.hierarchy.main()));
        assert!(matches!(
            f.hierarchy
                .session_for_role(f.hierarchy.main().dispatcher(), SessionRole::Background),
            Err(SessionError::RoleMismatch { .. })
        ));
    }
}
