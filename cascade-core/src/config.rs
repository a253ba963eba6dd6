//! Registry configuration.
//!
//! Everything has a default, so `RegistryConfig::default()` is what most
//! callers want. Hosts that keep settings in a file can deserialize the
//! struct directly; missing fields fall back to their defaults.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Default bound on nested reducer follow-up messages.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 64;

/// Default bound on effect rounds within one settle.
pub const DEFAULT_MAX_SETTLE_ROUNDS: usize = 1024;

/// Tunables for a [`Registry`](crate::store::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Name used in log output to tell several registries apart.
    pub name: Option<String>,

    /// How many reducer follow-up messages may chain off a single write.
    pub max_cascade_depth: usize,

    /// How many times effects may re-trigger each other before the settle
    /// loop gives up and drops the remaining work.
    pub max_settle_rounds: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            max_settle_rounds: DEFAULT_MAX_SETTLE_ROUNDS,
        }
    }
}

impl RegistryConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(source: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    pub fn with_max_settle_rounds(mut self, rounds: usize) -> Self {
        self.max_settle_rounds = rounds;
        self
    }

    /// Name shown in logs.
    pub(crate) fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("registry")
    }
}
