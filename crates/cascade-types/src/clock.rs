use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic version source shared by every session of a hierarchy.
///
/// Each change to an object's content inside a session is stamped with a
/// fresh value, so two views of the same object carry equal versions only
/// if one was copied from the other. Safe for concurrent use across
/// threads.
#[derive(Debug)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Issue a version strictly greater than any previously issued.
    pub fn tick(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued version (0 if none).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}
