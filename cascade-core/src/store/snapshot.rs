//! Registry snapshots.
//!
//! A [`TokenManifest`] names the containers that take part in a snapshot.
//! Capturing walks the manifest and records each container's value and meta
//! state; restoring decodes every entry first and then supplies them all in
//! one transaction, so subscribers see a single settled update.
//!
//! Snapshots encode to JSON for inspection and to MessagePack for storage.

use std::fmt;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::reactive::{Container, MetaState, StateValue};

use super::registry::Registry;

/// One captured container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub value: serde_json::Value,
    #[serde(default)]
    pub meta: MetaState,
}

/// Captured state of every manifest entry, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub states: IndexMap<String, StateSnapshot>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&StateSnapshot> {
        self.states.get(name)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, StoreError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

type Restore = Box<dyn FnOnce(&Registry) + Send>;

trait ManifestEntry: Send + Sync {
    fn capture(&self, name: &str, registry: &Registry) -> Result<StateSnapshot, StoreError>;

    fn decode(&self, name: &str, state: &StateSnapshot) -> Result<Restore, StoreError>;
}

struct ContainerEntry<T, M> {
    container: Container<T, M>,
}

impl<T, M> ManifestEntry for ContainerEntry<T, M>
where
    T: StateValue + Serialize + DeserializeOwned,
    M: Send + 'static,
{
    fn capture(&self, name: &str, registry: &Registry) -> Result<StateSnapshot, StoreError> {
        let value = self.container.publisher(registry)?.value();
        let value = serde_json::to_value(&value).map_err(|source| StoreError::Snapshot {
            key: name.to_string(),
            source,
        })?;
        Ok(StateSnapshot {
            value,
            meta: registry.get(&self.container.meta()),
        })
    }

    fn decode(&self, name: &str, state: &StateSnapshot) -> Result<Restore, StoreError> {
        let value: T =
            serde_json::from_value(state.value.clone()).map_err(|source| StoreError::Snapshot {
                key: name.to_string(),
                source,
            })?;
        // Nothing can resume a pending write after a restore.
        let meta = match &state.meta {
            MetaState::Pending { .. } => MetaState::Ok,
            other => other.clone(),
        };
        let container = self.container.clone();

        Ok(Box::new(move |registry: &Registry| {
            match container.writer(registry) {
                Ok(writer) => {
                    writer.supply(registry, value);
                    if !meta.is_ok() {
                        writer.set_meta(registry, meta);
                    }
                }
                Err(err) => warn!(token = %container, error = %err, "restore skipped"),
            }
        }))
    }
}

/// Named set of containers to snapshot.
#[derive(Default)]
pub struct TokenManifest {
    entries: IndexMap<String, Box<dyn ManifestEntry>>,
}

impl TokenManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `container` under `name`, replacing any earlier entry with that
    /// name.
    pub fn insert<T, M>(&mut self, name: impl Into<String>, container: &Container<T, M>) -> &mut Self
    where
        T: StateValue + Serialize + DeserializeOwned,
        M: Send + 'static,
    {
        self.entries.insert(
            name.into(),
            Box::new(ContainerEntry {
                container: container.clone(),
            }),
        );
        self
    }

    pub fn with<T, M>(mut self, name: impl Into<String>, container: &Container<T, M>) -> Self
    where
        T: StateValue + Serialize + DeserializeOwned,
        M: Send + 'static,
    {
        self.insert(name, container);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for TokenManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

impl Registry {
    /// Capture every container in `manifest`.
    pub fn serialize(&self, manifest: &TokenManifest) -> Result<Snapshot, StoreError> {
        let _cycle = self.lock_cycle();
        let mut states = IndexMap::with_capacity(manifest.len());
        for (name, entry) in &manifest.entries {
            states.insert(name.clone(), entry.capture(name, self)?);
        }
        debug!(registry = %self.name(), entries = states.len(), "snapshot captured");
        Ok(Snapshot { states })
    }

    /// Restore `snapshot` into the containers named by `manifest`.
    ///
    /// Entries missing from the snapshot keep their current value and names
    /// the manifest does not know are ignored. If any entry fails to decode
    /// nothing is applied.
    pub fn deserialize(&self, manifest: &TokenManifest, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.is_disposed() {
            return Err(StoreError::Disposed);
        }

        let mut restores = Vec::with_capacity(snapshot.len());
        for (name, entry) in &manifest.entries {
            match snapshot.get(name) {
                Some(state) => restores.push(entry.decode(name, state)?),
                None => trace!(entry = %name, "not in snapshot"),
            }
        }

        debug!(registry = %self.name(), entries = restores.len(), "restoring snapshot");
        self.transaction(|| {
            for restore in restores {
                restore(self);
            }
        });
        Ok(())
    }
}
