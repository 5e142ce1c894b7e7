use thiserror::Error;

use cascade_store::{ModelError, StoreError};
use cascade_types::{ObjectId, SessionId, SessionRole, ThreadToken};

/// Errors from session, save and lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A change record violates the object model. Nothing was committed.
    #[error("validation failed for {object}: {source}")]
    Validation {
        object: ObjectId,
        #[source]
        source: ModelError,
    },

    /// The backing holds a different version than the change was based on.
    /// Refresh the object and retry.
    #[error("conflict on {object}: based on {expected:?}, backing has {found:?}")]
    Conflict {
        object: ObjectId,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// An insert named an identity its backing already holds.
    #[error("object already exists: {0}")]
    ObjectExists(ObjectId),

    /// A session was touched from a thread that does not own it.
    #[error("{operation} on {session} from {caller}, owned by {owner}")]
    ThreadAffinityViolation {
        session: SessionId,
        owner: ThreadToken,
        caller: ThreadToken,
        operation: &'static str,
    },

    /// Hop `hop` of a cascading save failed. Hops before it stay committed,
    /// hops after it were not attempted.
    #[error("cascade failed at hop {hop} ({role} {session}) after {committed} committed hop(s): {source}")]
    Propagation {
        hop: usize,
        session: SessionId,
        role: SessionRole,
        committed: usize,
        #[source]
        source: Box<SessionError>,
    },

    #[error("store error: {0}")]
    Store(StoreError),

    /// The dispatcher's thread has stopped and no longer accepts work.
    #[error("dispatcher closed: {name}")]
    DispatcherClosed { name: String },

    /// The session was invalidated by a rebuild or registry eviction.
    #[error("session invalidated: {0}")]
    SessionInvalidated(SessionId),

    /// The session's parent has been dropped.
    #[error("parent of {0} is gone")]
    UnknownParent(SessionId),

    /// A parent chain does not reach `store` within the configured depth.
    #[error("parent chain of {session} does not terminate within {max_depth} hops")]
    ParentCycle { session: SessionId, max_depth: usize },

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// A canonical role is only created by the hierarchy.
    #[error("no {0} session is available for this thread")]
    RoleUnavailable(SessionRole),

    #[error("thread already holds a {existing} session, {requested} requested")]
    RoleMismatch {
        existing: SessionRole,
        requested: SessionRole,
    },

    #[error("thread {0} already owns a session")]
    ThreadOccupied(ThreadToken),

    /// The parent passed to a scratch session is not part of this hierarchy.
    #[error("session {0} does not belong to this hierarchy")]
    ForeignParent(SessionId),

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// The current thread is already bound to a dispatcher.
    #[error("thread {0} is already bound to a dispatcher")]
    AlreadyBound(ThreadToken),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                object,
                expected,
                found,
            } => Self::Conflict {
                object,
                expected,
                found,
            },
            StoreError::AlreadyExists(object) => Self::ObjectExists(object),
            StoreError::Invalid { object, source } => Self::Validation { object, source },
            other => Self::Store(other),
        }
    }
}

impl SessionError {
    /// The root cause, looking through `Propagation`.
    pub fn root(&self) -> &SessionError {
        match self {
            Self::Propagation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if the root cause is a version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Self::Conflict { .. } | Self::ObjectExists(_))
    }
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflict_maps_to_session_conflict() {
        let object = ObjectId::new();
        let err: SessionError = StoreError::Conflict {
            object,
            expected: Some(1),
            found: Some(2),
        }
        .into();
        assert!(matches!(
            err,
            SessionError::Conflict { expected: Some(1), found: Some(2), .. }
        ));
        assert!(err.is_conflict());
    }

    #[test]
    fn store_invalid_maps_to_validation() {
        let object = ObjectId::new();
        let err: SessionError = StoreError::Invalid {
            object,
            source: ModelError::UnknownEntity("Ghost".into()),
        }
        .into();
        assert!(matches!(err, SessionError::Validation { .. }));
    }

    #[test]
    fn other_store_errors_are_wrapped() {
        let err: SessionError = StoreError::ReadOnly.into();
        assert!(matches!(err, SessionError::Store(StoreError::ReadOnly)));
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn root_looks_through_propagation() {
        let inner = SessionError::Conflict {
            object: ObjectId::new(),
            expected: None,
            found: Some(3),
        };
        let err = SessionError::Propagation {
            hop: 2,
            session: SessionId::next(),
            role: SessionRole::Store,
            committed: 2,
            source: Box::new(inner),
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("hop 2"));
    }
}
