use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Position of a session in the hierarchy.
///
/// The role decides default parent wiring and thread affinity; it is not a
/// separate storage concept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionRole {
    /// Bound to the primary thread. Parent: `Background`.
    Main,
    /// Bound to a dedicated worker thread. Parent: `Store`.
    Background,
    /// Wired straight to the persistent store. No parent.
    Store,
    /// Ad-hoc session for isolated work, parented anywhere in the chain.
    Scratch,
}

impl SessionRole {
    /// `Main`, `Background` and `Store` exist exactly once per hierarchy.
    pub fn is_canonical(&self) -> bool {
        !matches!(self, Self::Scratch)
    }

    /// The role a session of this role is parented to by default.
    pub fn default_parent(&self) -> Option<SessionRole> {
        match self {
            Self::Main => Some(Self::Background),
            Self::Background => Some(Self::Store),
            Self::Store => None,
            Self::Scratch => Some(Self::Background),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Background => "background",
            Self::Store => "store",
            Self::Scratch => "scratch",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionRole {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "background" => Ok(Self::Background),
            "store" => Ok(Self::Store),
            "scratch" => Ok(Self::Scratch),
            other => Err(TypeError::UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_wiring_reaches_store() {
        for role in [
            SessionRole::Main,
            SessionRole::Background,
            SessionRole::Store,
            SessionRole::Scratch,
        ] {
            let mut current = role;
            let mut hops = 0;
            while let Some(parent) = current.default_parent() {
                current = parent;
                hops += 1;
                assert!(hops < 4);
            }
            assert_eq!(current, SessionRole::Store);
        }
    }

    #[test]
    fn only_scratch_is_not_canonical() {
        assert!(SessionRole::Main.is_canonical());
        assert!(SessionRole::Background.is_canonical());
        assert!(SessionRole::Store.is_canonical());
        assert!(!SessionRole::Scratch.is_canonical());
    }

    #[test]
    fn parses_display_form() {
        for role in [SessionRole::Main, SessionRole::Scratch] {
            assert_eq!(role.to_string().parse::<SessionRole>().unwrap(), role);
        }
        assert!("ui".parse::<SessionRole>().is_err());
    }
}
