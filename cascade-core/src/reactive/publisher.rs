//! Publishers.
//!
//! A publisher is the live object backing a token inside one registry: it
//! owns the current value, the listener list and the change stamp. Every
//! token kind supplies its own publisher type; what they share lives in
//! [`PublisherCore`].

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::graph::{ListenerList, NodeId, NodeKind};
use crate::store::Registry;

use super::token::TokenLabel;

/// Behaviour every publisher provides to the propagation engine.
pub trait Publisher: Send + Sync + 'static {
    fn core(&self) -> &PublisherCore;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Bring the value up to date before it is read.
    ///
    /// Source publishers are always current. Derivations recompute here if
    /// one of their inputs actually changed.
    fn refresh(&self, _registry: &Registry) -> Result<(), StoreError> {
        Ok(())
    }

    /// Mark the publisher as possibly stale during a notify walk.
    ///
    /// Returns `true` if the walk must continue into this publisher's own
    /// listeners. Only derivations ever return `true`.
    fn invalidate(&self) -> bool {
        false
    }

    /// Force a recompute on the next read, whatever the inputs say.
    ///
    /// Returns `true` if the publisher was clean before. Sources ignore it.
    fn mark_stale(&self) -> bool {
        false
    }
}

/// State shared by every publisher kind.
pub struct PublisherCore {
    id: NodeId,
    kind: NodeKind,
    label: String,
    listeners: Mutex<ListenerList>,
    changed_at: AtomicU64,
}

impl PublisherCore {
    pub fn new(kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            label: label.into(),
            listeners: Mutex::new(ListenerList::new()),
            changed_at: AtomicU64::new(0),
        }
    }

    pub fn for_token(kind: NodeKind, label: &TokenLabel) -> Self {
        Self::new(kind, label.to_string())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stamp of the last actual value change (0 if never changed).
    pub fn changed_at(&self) -> u64 {
        self.changed_at.load(Ordering::Acquire)
    }

    pub(crate) fn mark_changed(&self, stamp: u64) {
        self.changed_at.store(stamp, Ordering::Release);
    }

    pub(crate) fn listeners(&self) -> MutexGuard<'_, ListenerList> {
        self.listeners.lock()
    }

    /// Number of listener entries, stale ones included.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl std::fmt::Debug for PublisherCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("changed_at", &self.changed_at())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// Borrow a publisher as its concrete type.
pub(crate) fn downcast<'a, P: Publisher>(
    publisher: &'a dyn Publisher,
) -> Result<&'a P, StoreError> {
    publisher
        .as_any()
        .downcast_ref::<P>()
        .ok_or_else(|| StoreError::KindMismatch {
            token: publisher.core().label().to_string(),
        })
}

/// Take a shared handle to a publisher as its concrete type.
pub(crate) fn downcast_arc<P: Publisher>(
    publisher: Arc<dyn Publisher>,
) -> Result<Arc<P>, StoreError> {
    let label = publisher.core().label().to_string();
    publisher
        .into_any()
        .downcast::<P>()
        .map_err(|_| StoreError::KindMismatch { token: label })
}

/// Public view of a publisher, as returned by
/// [`Registry::get_state`](crate::store::Registry::get_state).
#[derive(Clone)]
pub struct PublisherRef(pub(crate) Arc<dyn Publisher>);

impl PublisherRef {
    pub fn label(&self) -> &str {
        self.0.core().label()
    }

    pub fn kind(&self) -> NodeKind {
        self.0.core().kind()
    }

    pub fn changed_at(&self) -> u64 {
        self.0.core().changed_at()
    }

    /// Number of listener entries, stale ones included. Stale entries are
    /// pruned the next time the publisher notifies.
    pub fn listener_count(&self) -> usize {
        self.0.core().listener_count()
    }

    /// Whether both handles point at the same publisher.
    pub fn ptr_eq(&self, other: &PublisherRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for PublisherRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.core().fmt(f)
    }
}
