use std::sync::Arc;

use tracing::info;

use cascade_store::{ObjectModel, PersistentStore};
use cascade_types::{CommitEvent, SessionRole, VersionClock};

use crate::config::HierarchyConfig;
use crate::coordinator::{CascadeFuture, CascadeReport, HopReport, SaveCoordinator};
use crate::dispatcher::{Dispatcher, WorkerThread};
use crate::error::{SessionError, SessionResult};
use crate::hierarchy::{Blueprint, HierarchyDispatchers, SessionHierarchy};
use crate::lifecycle::LifecycleManager;
use crate::merge::MergeBus;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// High-level entry point: one session hierarchy over one persistent store.
///
/// `background` and `store` get dedicated worker threads; `main` lives on
/// the dispatcher handed in by the caller, usually the primary thread's
/// [`RunLoop`](crate::RunLoop).
pub struct Cascade {
    lifecycle: LifecycleManager,
    registry: Arc<SessionRegistry>,
    bus: Arc<MergeBus>,
    coordinator: SaveCoordinator,
    config: HierarchyConfig,
    workers: Vec<WorkerThread>,
}

impl Cascade {
    pub fn new(
        config: HierarchyConfig,
        store: Arc<dyn PersistentStore>,
        model: ObjectModel,
        main: Dispatcher,
    ) -> SessionResult<Self> {
        config.validate()?;
        let background = WorkerThread::spawn(config.background_thread_name.clone())?;
        let store_worker = WorkerThread::spawn(config.store_thread_name.clone())?;

        let blueprint = Blueprint {
            config: config.clone(),
            dispatchers: HierarchyDispatchers {
                main,
                background: background.dispatcher(),
                store: store_worker.dispatcher(),
            },
            store,
            model: Arc::new(model),
            clock: Arc::new(VersionClock::new()),
        };
        let registry = Arc::new(SessionRegistry::new());
        let bus = Arc::new(MergeBus::new());
        let lifecycle = LifecycleManager::new(blueprint, Arc::clone(&registry), Arc::clone(&bus))?;
        let coordinator = SaveCoordinator::new(Arc::clone(&bus), config.max_chain_depth);

        info!(
            background = %config.background_thread_name,
            store = %config.store_thread_name,
            "cascade started"
        );
        Ok(Self {
            lifecycle,
            registry,
            bus,
            coordinator,
            config,
            workers: vec![background, store_worker],
        })
    }

    // ---- Sessions ----

    pub fn hierarchy(&self) -> Arc<SessionHierarchy> {
        self.lifecycle.hierarchy()
    }

    pub fn main(&self) -> Arc<Session> {
        Arc::clone(self.hierarchy().main())
    }

    pub fn background(&self) -> Arc<Session> {
        Arc::clone(self.hierarchy().background())
    }

    /// The session wired to the persistent store.
    pub fn store(&self) -> Arc<Session> {
        Arc::clone(self.hierarchy().store())
    }

    /// The canonical session for `role`.
    pub fn session(&self, role: SessionRole) -> SessionResult<Arc<Session>> {
        self.hierarchy()
            .session(role)
            .cloned()
            .ok_or(SessionError::RoleUnavailable(role))
    }

    /// The session owned by `dispatcher`'s thread, created under
    /// `background` on first access.
    pub fn session_for(&self, dispatcher: &Dispatcher) -> SessionResult<Arc<Session>> {
        self.hierarchy().session_for(dispatcher)
    }

    pub fn session_for_role(&self, dispatcher: &Dispatcher, role: SessionRole) -> SessionResult<Arc<Session>> {
        self.hierarchy().session_for_role(dispatcher, role)
    }

    pub fn create_scratch_session(
        &self,
        parent: &Arc<Session>,
        dispatcher: Dispatcher,
    ) -> SessionResult<Arc<Session>> {
        self.hierarchy().create_scratch_session(parent, dispatcher)
    }

    // ---- Saving ----

    pub fn save(&self, session: &Arc<Session>) -> SessionResult<HopReport> {
        self.coordinator.save(session)
    }

    pub fn save_cascading(&self, session: &Arc<Session>) -> SessionResult<CascadeReport> {
        self.coordinator.save_cascading(session)
    }

    pub fn save_cascading_async<F>(&self, session: &Arc<Session>, on_complete: F)
    where
        F: FnOnce(SessionResult<CascadeReport>) + Send + 'static,
    {
        self.coordinator.save_cascading_async(session, on_complete)
    }

    pub fn save_cascading_future(&self, session: &Arc<Session>) -> CascadeFuture {
        self.coordinator.save_cascading_future(session)
    }

    // ---- Merging ----

    pub fn subscribe(&self, subscriber: &Arc<Session>, source: &Session) -> SessionResult<()> {
        self.bus.subscribe(subscriber, source)
    }

    pub fn subscribe_with<F>(&self, subscriber: &Arc<Session>, source: &Session, hook: F) -> SessionResult<()>
    where
        F: Fn(&Session, &CommitEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe_with(subscriber, source, hook)
    }

    pub fn unsubscribe(&self, subscriber: &Session, source: &Session) -> bool {
        self.bus.unsubscribe(subscriber, source)
    }

    // ---- Lifecycle ----

    pub fn rebuild_hierarchy(&self) -> SessionResult<()> {
        self.lifecycle.rebuild_hierarchy().map(|_| ())
    }

    /// Empty the persistent store and rebuild the hierarchy.
    pub fn reset_store(&self) -> SessionResult<()> {
        self.lifecycle.reset_store().map(|_| ())
    }

    /// Returns `true` if the persistent store holds any objects.
    pub fn store_exists(&self) -> SessionResult<bool> {
        Ok(!self.lifecycle.persistent_store().is_empty()?)
    }

    pub fn persistent_store(&self) -> &Arc<dyn PersistentStore> {
        self.lifecycle.persistent_store()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn merge_bus(&self) -> &MergeBus {
        &self.bus
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Invalidate every session and stop the worker threads.
    pub fn shutdown(&mut self) {
        self.lifecycle.shutdown();
        for worker in &mut self.workers {
            worker.shutdown();
        }
        info!("cascade shut down");
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade")
            .field("lifecycle", &self.lifecycle)
            .field("registry", &self.registry)
            .field("bus", &self.bus)
            .finish()
    }
}
