use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Configuration for building a session hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Name of the worker thread that owns the `background` session.
    pub background_thread_name: String,
    /// Name of the worker thread that owns the `store` session.
    pub store_thread_name: String,
    /// Whether `main` is subscribed to `background` commits on build.
    pub merge_main_from_background: bool,
    /// Whether `main` records undo history.
    pub main_undo_enabled: bool,
    /// Upper bound on parent-chain length. A chain that does not reach
    /// `store` within this many hops is rejected.
    pub max_chain_depth: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            background_thread_name: "cascade-background".into(),
            store_thread_name: "cascade-store".into(),
            merge_main_from_background: true,
            main_undo_enabled: false,
            max_chain_depth: 16,
        }
    }
}

impl HierarchyConfig {
    /// Parse a TOML document. Missing keys take their default.
    pub fn from_toml_str(input: &str) -> SessionResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> SessionResult<String> {
        toml::to_string(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Reject settings the hierarchy cannot be built with.
    pub fn validate(&self) -> SessionResult<()> {
        // main -> background -> store is the shortest canonical chain.
        if self.max_chain_depth < 3 {
            return Err(SessionError::Config(format!(
                "max_chain_depth must be at least 3, got {}",
                self.max_chain_depth
            )));
        }
        if self.background_thread_name == self.store_thread_name {
            return Err(SessionError::Config(
                "background and store threads need distinct names".into(),
            ));
        }
        Ok(())
    }
}
