//! Container Implementation
//!
//! A container is the writable leaf of the graph. It holds a value that is
//! only ever changed by dispatching a write.
//!
//! # How Writes Work
//!
//! 1. The incoming message goes through the reducer, which turns it into the
//!    next value and optionally a follow-up message. Without a custom
//!    reducer the message *is* the next value.
//!
//! 2. If an `on_write` hook is configured it sees the proposed value and
//!    decides: commit it (possibly altered), reject the write, or suspend.
//!    A suspended write leaves the value untouched and puts the meta state
//!    in `Pending` until its continuation resolves.
//!
//! 3. On commit the value is stored, listeners are notified, the meta state
//!    returns to `Ok`, and the follow-up message (if any) is applied in the
//!    same transaction.
//!
//! A commit always notifies, even if the new value equals the old one.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{StoreError, WriteError};
use crate::graph::NodeKind;
use crate::store::{Registry, StoreMessage};

use super::context::Get;
use super::meta::MetaToken;
use super::publisher::{downcast, downcast_arc, Publisher, PublisherCore};
use super::token::{Readable, StateToken, StateValue, TokenId, TokenKind, TokenLabel};
use super::writer::StateWriter;

/// Result of a reducer: the next value plus an optional message to apply
/// right after it is committed.
pub struct Reduced<T> {
    pub value: T,
    pub message: Option<StoreMessage>,
}

impl<T> Reduced<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            message: None,
        }
    }

    /// Apply `message` once this value is committed.
    pub fn then(mut self, message: StoreMessage) -> Self {
        self.message = Some(message);
        self
    }
}

/// What a write hook or initializer decided.
pub enum HookOutcome<T> {
    /// Store this value.
    Commit(T),
    /// Leave the value as is and report an error in the meta state.
    Reject(WriteError),
    /// Leave the value as is, report `Pending`, and resume later.
    Suspend(Suspended<T>),
}

impl<T> HookOutcome<T> {
    pub fn reject(reason: impl Into<String>, message: impl Into<String>) -> Self {
        HookOutcome::Reject(WriteError::new(reason, message))
    }

    /// Suspend with a pending `message`; `resume` runs when the registry
    /// processes its task queue.
    pub fn suspend<F>(message: impl Into<String>, resume: F) -> Self
    where
        F: FnOnce(&mut Get<'_>) -> HookOutcome<T> + Send + 'static,
    {
        HookOutcome::Suspend(Suspended {
            message: message.into(),
            resume: Box::new(resume),
        })
    }
}

/// Continuation of a suspended write.
pub struct Suspended<T> {
    pub(crate) message: String,
    pub(crate) resume: Box<dyn FnOnce(&mut Get<'_>) -> HookOutcome<T> + Send>,
}

impl<T> Suspended<T> {
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Turns an incoming message and the current value into the next value.
pub type Reducer<T, M> = Arc<dyn Fn(M, &T) -> Result<Reduced<T>, WriteError> + Send + Sync>;

/// Intercepts a reduced value before it is committed.
pub type WriteHook<T> = Arc<dyn Fn(&mut Get<'_>, T) -> HookOutcome<T> + Send + Sync>;

/// Computes the starting value when a registry first touches the container.
pub type Initializer<T> = Arc<dyn Fn(&mut Get<'_>) -> HookOutcome<T> + Send + Sync>;

struct ContainerDef<T, M> {
    meta_id: TokenId,
    initial: T,
    reducer: Reducer<T, M>,
    hook: Option<WriteHook<T>>,
    initializer: Option<Initializer<T>>,
}

/// Writable state token.
///
/// `M` is the message type accepted by [`Container::write`]; it defaults to
/// the value type, in which case a write simply replaces the value.
pub struct Container<T, M = T> {
    label: TokenLabel,
    def: Arc<ContainerDef<T, M>>,
}

impl<T: StateValue> Container<T> {
    /// A container whose writes replace the value.
    pub fn new(initial: T) -> Self {
        Self::builder(initial).build()
    }

    pub fn builder(initial: T) -> ContainerBuilder<T> {
        ContainerBuilder {
            label: TokenLabel::new(TokenKind::Container),
            initial,
            reducer: Arc::new(|value: T, _: &T| Ok(Reduced::new(value))),
            hook: None,
            initializer: None,
        }
    }
}

impl<T, M> Container<T, M>
where
    T: StateValue,
    M: Send + 'static,
{
    /// Give the container a debug name.
    pub fn named(mut self, name: &str) -> Self {
        self.label.set_name(name);
        self
    }

    /// Give the container a stable string id.
    pub fn with_key(mut self, key: &str) -> Self {
        self.label.set_key(key);
        self
    }

    /// The companion meta token.
    pub fn meta(&self) -> MetaToken {
        MetaToken::new(self.def.meta_id, &self.label)
    }

    pub fn initial(&self) -> &T {
        &self.def.initial
    }

    /// A message writing `message` to this container.
    pub fn write(&self, message: M) -> StoreMessage {
        let token = self.clone();
        StoreMessage::from_write(self.label.to_string(), move |registry| {
            match token.writer(registry) {
                Ok(writer) => writer.write(registry, &token.def.reducer, message),
                Err(err) => {
                    warn!(token = %token.label, error = %err, "write skipped");
                    None
                }
            }
        })
    }

    pub(crate) fn publisher(
        &self,
        registry: &Registry,
    ) -> Result<Arc<ContainerPublisher<T>>, StoreError> {
        downcast_arc(registry.publisher(self))
    }

    pub(crate) fn writer(&self, registry: &Registry) -> Result<StateWriter<T>, StoreError> {
        let publisher = self.publisher(registry)?;
        Ok(StateWriter::new(publisher, Some(self.meta())).with_hook(self.def.hook.clone()))
    }
}

impl<T, M> Clone for Container<T, M> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            def: Arc::clone(&self.def),
        }
    }
}

impl<T, M> PartialEq for Container<T, M> {
    fn eq(&self, other: &Self) -> bool {
        self.label.id() == other.label.id()
    }
}

impl<T, M> Eq for Container<T, M> {}

impl<T, M> std::hash::Hash for Container<T, M> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.label.id().hash(state);
    }
}

impl<T, M> fmt::Display for Container<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label.fmt(f)
    }
}

impl<T, M> fmt::Debug for Container<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Container").field(&self.label.to_string()).finish()
    }
}

impl<T, M> StateToken for Container<T, M>
where
    T: StateValue,
    M: Send + 'static,
{
    fn label(&self) -> &TokenLabel {
        &self.label
    }

    fn create_publisher(&self, _registry: &Registry) -> Arc<dyn Publisher> {
        Arc::new(ContainerPublisher::new(
            PublisherCore::for_token(NodeKind::Source, &self.label),
            self.def.initial.clone(),
        ))
    }

    fn on_created(&self, registry: &Registry, publisher: &Arc<dyn Publisher>) {
        let Some(initializer) = self.def.initializer.clone() else {
            return;
        };
        let publisher = match downcast_arc::<ContainerPublisher<T>>(Arc::clone(publisher)) {
            Ok(publisher) => publisher,
            Err(err) => {
                warn!(token = %self.label, error = %err, "initializer skipped");
                return;
            }
        };
        let writer = StateWriter::new(publisher, Some(self.meta()));
        registry.transaction(|| writer.initialize(registry, &initializer));
    }
}

impl<T, M> Readable for Container<T, M>
where
    T: StateValue,
    M: Send + 'static,
{
    type Value = T;

    fn read(&self, get: &mut Get<'_>) -> Result<T, StoreError> {
        let publisher = get.registry().publisher(self);
        get.track(&publisher);
        Ok(downcast::<ContainerPublisher<T>>(&*publisher)?.value())
    }

    fn bind(&self, _registry: &Registry) -> Arc<dyn Readable<Value = T>> {
        Arc::new(self.clone())
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

/// Builder for containers with a reducer, hook or initializer.
pub struct ContainerBuilder<T, M = T> {
    label: TokenLabel,
    initial: T,
    reducer: Reducer<T, M>,
    hook: Option<WriteHook<T>>,
    initializer: Option<Initializer<T>>,
}

impl<T, M> ContainerBuilder<T, M>
where
    T: StateValue,
    M: Send + 'static,
{
    pub fn named(mut self, name: &str) -> Self {
        self.label.set_name(name);
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.label.set_key(key);
        self
    }

    /// Accept messages of type `N`, reduced against the current value.
    pub fn reducer<N, F>(self, reducer: F) -> ContainerBuilder<T, N>
    where
        N: Send + 'static,
        F: Fn(N, &T) -> Result<Reduced<T>, WriteError> + Send + Sync + 'static,
    {
        ContainerBuilder {
            label: self.label,
            initial: self.initial,
            reducer: Arc::new(reducer),
            hook: self.hook,
            initializer: self.initializer,
        }
    }

    /// Intercept every reduced value before it is committed.
    pub fn on_write<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Get<'_>, T) -> HookOutcome<T> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Compute the starting value per registry (may suspend).
    pub fn initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&mut Get<'_>) -> HookOutcome<T> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn build(self) -> Container<T, M> {
        Container {
            label: self.label,
            def: Arc::new(ContainerDef {
                meta_id: TokenId::next(),
                initial: self.initial,
                reducer: self.reducer,
                hook: self.hook,
                initializer: self.initializer,
            }),
        }
    }
}

/// Publisher of a container (and of each collection slot).
pub struct ContainerPublisher<T> {
    core: PublisherCore,
    value: RwLock<T>,
    write_seq: AtomicU64,
}

impl<T: StateValue> ContainerPublisher<T> {
    pub(crate) fn new(core: PublisherCore, value: T) -> Self {
        Self {
            core,
            value: RwLock::new(value),
            write_seq: AtomicU64::new(0),
        }
    }

    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    pub(crate) fn replace(&self, value: T) {
        *self.value.write() = value;
    }

    /// Start a new logical write. Any earlier write still waiting on a
    /// suspended hook is superseded.
    pub(crate) fn begin_write(&self) -> u64 {
        self.write_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn is_latest(&self, seq: u64) -> bool {
        self.write_seq.load(Ordering::Acquire) == seq
    }
}

impl<T: StateValue> Publisher for ContainerPublisher<T> {
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

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
