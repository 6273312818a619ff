//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::source::DEFAULT_MAX_ECHO_DEPTH;

/// Tunables for a [`SyncEngine`](crate::SyncEngine).
///
/// Deserializes with defaults for missing keys, so a config file only needs
/// to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Write a value back into the table when a record setter normalizes it.
    pub echo_normalized: bool,
    /// How many echoed writes may chain off one `set_field` call.
    pub max_echo_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            echo_normalized: true,
            max_echo_depth: DEFAULT_MAX_ECHO_DEPTH,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_echo_normalized(mut self, enabled: bool) -> Self {
        self.echo_normalized = enabled;
        self
    }

    pub fn with_max_echo_depth(mut self, depth: usize) -> Self {
        self.max_echo_depth = depth;
        self
    }

    /// Parse from a JSON document, e.g. a section of an app config file.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
