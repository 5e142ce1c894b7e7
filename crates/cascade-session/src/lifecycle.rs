use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use cascade_store::PersistentStore;

use crate::error::SessionResult;
use crate::hierarchy::{Blueprint, SessionHierarchy};
use crate::merge::MergeBus;
use crate::registry::SessionRegistry;

/// Owns the current hierarchy and replaces it wholesale on request.
///
/// A rebuild invalidates every registered session, drops all merge
/// subscriptions and builds fresh canonical sessions on the same threads.
/// In-flight saves are not quiesced: callers must not hold references into
/// the old hierarchy across a rebuild.
pub struct LifecycleManager {
    blueprint: Blueprint,
    current: RwLock<Arc<SessionHierarchy>>,
    registry: Arc<SessionRegistry>,
    bus: Arc<MergeBus>,
    generation: AtomicU64,
}

impl LifecycleManager {
    pub(crate) fn new(
        blueprint: Blueprint,
        registry: Arc<SessionRegistry>,
        bus: Arc<MergeBus>,
    ) -> SessionResult<Self> {
        let hierarchy = SessionHierarchy::build(&blueprint, &registry, &bus)?;
        Ok(Self {
            blueprint,
            current: RwLock::new(Arc::new(hierarchy)),
            registry,
            bus,
            generation: AtomicU64::new(1),
        })
    }

    /// The current hierarchy.
    pub fn hierarchy(&self) -> Arc<SessionHierarchy> {
        Arc::clone(&self.current.read().expect("lifecycle lock poisoned"))
    }

    /// How many hierarchies have been built, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn persistent_store(&self) -> &Arc<dyn PersistentStore> {
        &self.blueprint.store
    }

    /// Tear down every session and build a fresh hierarchy.
    pub fn rebuild_hierarchy(&self) -> SessionResult<Arc<SessionHierarchy>> {
        let mut current = self.current.write().expect("lifecycle lock poisoned");
        current.invalidate();
        let dropped = self.registry.invalidate_all();
        self.bus.clear();

        let fresh = Arc::new(SessionHierarchy::build(&self.blueprint, &self.registry, &self.bus)?);
        *current = Arc::clone(&fresh);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, dropped, main = %fresh.main().id(), "hierarchy rebuilt");
        Ok(fresh)
    }

    /// Drop every object from the persistent store, then rebuild so no
    /// session keeps objects the store no longer has.
    pub fn reset_store(&self) -> SessionResult<Arc<SessionHierarchy>> {
        warn!("resetting persistent store");
        self.blueprint.store.reset()?;
        self.rebuild_hierarchy()
    }

    pub(crate) fn shutdown(&self) {
        self.hierarchy().invalidate();
        self.registry.invalidate_all();
        self.bus.clear();
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("generation", &self.generation())
            .field("hierarchy", &self.hierarchy())
            .finish()
    }
}
