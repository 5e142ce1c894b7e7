use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use cascade_types::{SessionRole, ThreadToken};

use crate::dispatcher::Dispatcher;
use crate::error::{SessionError, SessionResult};
use crate::session::Session;

/// Table of live sessions keyed by owning thread.
///
/// At most one session per thread. Lookups that create a session hold the
/// table lock while the session is built, so two concurrent first lookups
/// for the same thread never produce two sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ThreadToken, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, thread: ThreadToken) -> Option<Arc<Session>> {
        self.lock().get(&thread).cloned()
    }

    /// The session owned by `dispatcher`'s thread, created with `create` on
    /// first access.
    pub fn session_for<F>(&self, dispatcher: &Dispatcher, create: F) -> SessionResult<Arc<Session>>
    where
        F: FnOnce() -> SessionResult<Arc<Session>>,
    {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(&dispatcher.token()) {
            return Ok(Arc::clone(existing));
        }
        let session = create()?;
        debug!(
            session = %session.id(),
            role = %session.role(),
            thread = %dispatcher.name(),
            "session registered"
        );
        sessions.insert(dispatcher.token(), Arc::clone(&session));
        Ok(session)
    }

    /// Like [`session_for`](Self::session_for), but the thread's session
    /// must have `role`.
    ///
    /// Canonical roles are never created here; only the hierarchy builds
    /// them.
    pub fn session_for_role<F>(
        &self,
        dispatcher: &Dispatcher,
        role: SessionRole,
        create: F,
    ) -> SessionResult<Arc<Session>>
    where
        F: FnOnce() -> SessionResult<Arc<Session>>,
    {
        if let Some(existing) = self.get(dispatcher.token()) {
            if existing.role() != role {
                return Err(SessionError::RoleMismatch {
                    existing: existing.role(),
                    requested: role,
                });
            }
            return Ok(existing);
        }
        if role.is_canonical() {
            return Err(SessionError::RoleUnavailable(role));
        }
        let session = self.session_for(dispatcher, create)?;
        if session.role() != role {
            // Another caller registered a different session in between.
            return Err(SessionError::RoleMismatch {
                existing: session.role(),
                requested: role,
            });
        }
        Ok(session)
    }

    /// Add a session built elsewhere. Fails if its thread already owns one.
    pub fn register(&self, session: Arc<Session>) -> SessionResult<()> {
        let mut sessions = self.lock();
        let owner = session.owner();
        if sessions.contains_key(&owner) {
            return Err(SessionError::ThreadOccupied(owner));
        }
        debug!(
            session = %session.id(),
            role = %session.role(),
            thread = %session.dispatcher().name(),
            "session registered"
        );
        sessions.insert(owner, session);
        Ok(())
    }

    /// Drop and invalidate the session owned by `thread`.
    pub fn invalidate(&self, thread: ThreadToken) -> Option<Arc<Session>> {
        let session = self.lock().remove(&thread)?;
        session.invalidate();
        Some(session)
    }

    /// Drop and invalidate every session. Returns how many were dropped.
    pub fn invalidate_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.invalidate();
        }
        debug!(count = drained.len(), "registry cleared");
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadToken, Arc<Session>>> {
        self.sessions.lock().expect("registry lock poisoned")
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}
