use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identity of a persistent object (UUID v7, so ids sort by creation time).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(uuid::Uuid);

impl ObjectId {
    /// Generate a fresh object identity.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Short representation (first 8 characters of the UUID).
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("obj:").unwrap_or(s);
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TypeError::InvalidObjectId(e.to_string()))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_id())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Opaque session handle. Unique for the lifetime of the process; a
/// rebuilt hierarchy never reuses an id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next session id.
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Opaque identity of an OS thread.
///
/// Sessions are bound to exactly one token; every mutation entry point
/// compares the caller's token against the owner's.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadToken(ThreadId);

impl ThreadToken {
    /// Token of the calling thread.
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }

    /// Returns `true` if the calling thread is the one this token names.
    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }
}

impl From<ThreadId> for ThreadToken {
    fn from(id: ThreadId) -> Self {
        Self(id)
    }
}

impl fmt::Debug for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadToken({:?})", self.0)
    }
}

impl fmt::Display for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_are_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn object_id_parses_display_form() {
        let id = ObjectId::new();
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        let bare: ObjectId = id.as_uuid().to_string().parse().unwrap();
        assert_eq!(id, bare);
    }

    #[test]
    fn object_id_rejects_garbage() {
        let err = "obj:not-a-uuid".parse::<ObjectId>().unwrap_err();
        assert!(matches!(err, TypeError::InvalidObjectId(_)));
    }

    #[test]
    fn short_id_format() {
        let id = ObjectId::new();
        assert_eq!(id.short_id().len(), 8);
    }

    #[test]
    fn session_ids_increase() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b > a);
        assert_eq!(format!("{a}"), format!("session#{}", a.as_u64()));
    }

    #[test]
    fn thread_tokens_differ_across_threads() {
        let here = ThreadToken::current();
        let there = std::thread::spawn(ThreadToken::current).join().unwrap();
        assert_ne!(here, there);
        assert!(here.is_current());
        assert!(!there.is_current());
    }

    #[test]
    fn thread_token_is_stable_on_one_thread() {
        assert_eq!(ThreadToken::current(), ThreadToken::current());
    }
}
