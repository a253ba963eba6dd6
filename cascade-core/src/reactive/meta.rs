//! Meta state.
//!
//! Every container has a companion read-only meta token reporting whether
//! its latest write is settled (`Ok`), waiting on a suspended hook
//! (`Pending`) or was rejected (`Error`). Meta publishers are ordinary
//! source publishers, so meta subscribers get the same glitch-free ordering
//! as subscribers of the container itself.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, WriteError};
use crate::graph::NodeKind;
use crate::store::Registry;

use super::context::Get;
use super::publisher::{downcast, Publisher, PublisherCore};
use super::token::{Readable, StateToken, TokenId, TokenLabel};

/// Status of the latest write to a container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MetaState {
    #[default]
    Ok,
    Pending {
        message: String,
    },
    Error {
        reason: String,
        message: String,
    },
}

impl MetaState {
    pub fn pending(message: impl Into<String>) -> Self {
        MetaState::Pending {
            message: message.into(),
        }
    }

    pub fn error(reason: impl Into<String>, message: impl Into<String>) -> Self {
        MetaState::Error {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, MetaState::Ok)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MetaState::Pending { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MetaState::Error { .. })
    }
}

impl From<WriteError> for MetaState {
    fn from(err: WriteError) -> Self {
        MetaState::Error {
            reason: err.reason,
            message: err.message,
        }
    }
}

/// Read-only token for a container's meta state.
#[derive(Clone)]
pub struct MetaToken {
    label: TokenLabel,
}

impl MetaToken {
    pub(crate) fn new(id: TokenId, owner: &TokenLabel) -> Self {
        Self {
            label: TokenLabel::meta(id, owner),
        }
    }

    pub(crate) fn publisher(&self, registry: &Registry) -> Result<Arc<MetaPublisher>, StoreError> {
        super::publisher::downcast_arc(registry.publisher(self))
    }
}

impl PartialEq for MetaToken {
    fn eq(&self, other: &Self) -> bool {
        self.label.id() == other.label.id()
    }
}

impl Eq for MetaToken {}

impl fmt::Display for MetaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label.fmt(f)
    }
}

impl fmt::Debug for MetaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetaToken").field(&self.label.to_string()).finish()
    }
}

impl StateToken for MetaToken {
    fn label(&self) -> &TokenLabel {
        &self.label
    }

    fn create_publisher(&self, _registry: &Registry) -> Arc<dyn Publisher> {
        Arc::new(MetaPublisher {
            core: PublisherCore::for_token(NodeKind::Source, &self.label),
            state: RwLock::new(MetaState::Ok),
        })
    }
}

impl Readable for MetaToken {
    type Value = MetaState;

    fn read(&self, get: &mut Get<'_>) -> Result<MetaState, StoreError> {
        let publisher = get.registry().publisher(self);
        get.track(&publisher);
        Ok(downcast::<MetaPublisher>(&*publisher)?.state())
    }

    fn bind(&self, _registry: &Registry) -> Arc<dyn Readable<Value = MetaState>> {
        Arc::new(self.clone())
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

/// Publisher of a meta token.
pub struct MetaPublisher {
    core: PublisherCore,
    state: RwLock<MetaState>,
}

impl MetaPublisher {
    pub fn state(&self) -> MetaState {
        self.state.read().clone()
    }

    /// Store a new state. Returns `false` when it equals the current one.
    pub(crate) fn replace(&self, state: MetaState) -> bool {
        let mut current = self.state.write();
        if *current == state {
            return false;
        }
        *current = state;
        true
    }
}

impl Publisher for MetaPublisher {
    fn core(&self) -> &PublisherCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
