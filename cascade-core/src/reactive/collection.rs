//! Keyed collections.
//!
//! A collection is a family of independent container-like slots sharing one
//! token. Each key gets its own publisher (and so its own listener list) the
//! first time it is read or written, initialized from the collection's
//! per-key initializer. Slots have no meta token; rejected slot writes are
//! only logged.
//!
//! `clear()` drops every slot together with its listener list. Effects
//! subscribed to a dropped slot are not notified and never hear from it
//! again. Derivations that read a dropped slot recompute on their next read,
//! so they pick up the fresh initial value the next access to a key starts
//! from.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, WriteError};
use crate::graph::NodeKind;
use crate::store::{Registry, StoreMessage};

use super::container::{ContainerPublisher, Reduced, Reducer};
use super::context::Get;
use super::publisher::{downcast_arc, Publisher, PublisherCore};
use super::token::{Readable, StateToken, StateValue, TokenKind, TokenLabel};
use super::writer::StateWriter;

/// Types usable as collection keys.
pub trait SlotKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<K> SlotKey for K where K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

type SlotInit<K, T> = Arc<dyn Fn(&K) -> T + Send + Sync>;

struct CollectionDef<K, T, M> {
    init: SlotInit<K, T>,
    reducer: Reducer<T, M>,
}

/// Keyed family of writable slots.
pub struct Collection<K, T, M = T> {
    label: TokenLabel,
    def: Arc<CollectionDef<K, T, M>>,
}

impl<K: SlotKey, T: StateValue> Collection<K, T> {
    /// Slots start at `init(key)` and writes replace the value.
    pub fn new<F>(init: F) -> Self
    where
        F: Fn(&K) -> T + Send + Sync + 'static,
    {
        Self::with_reducer(init, |value: T, _: &T| Ok(Reduced::new(value)))
    }
}

impl<K, T, M> Collection<K, T, M>
where
    K: SlotKey,
    T: StateValue,
    M: Send + 'static,
{
    /// Slots start at `init(key)` and writes go through `reducer`.
    pub fn with_reducer<F, R>(init: F, reducer: R) -> Self
    where
        F: Fn(&K) -> T + Send + Sync + 'static,
        R: Fn(M, &T) -> Result<Reduced<T>, WriteError> + Send + Sync + 'static,
    {
        Self {
            label: TokenLabel::new(TokenKind::Collection),
            def: Arc::new(CollectionDef {
                init: Arc::new(init),
                reducer: Arc::new(reducer),
            }),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.label.set_name(name);
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.label.set_key(key);
        self
    }

    /// Readable token for one key.
    pub fn key(&self, key: K) -> CollectionKey<K, T, M> {
        CollectionKey {
            collection: self.clone(),
            key,
        }
    }

    /// A message writing `message` to the slot for `key`.
    pub fn write(&self, key: K, message: M) -> StoreMessage {
        let collection = self.clone();
        StoreMessage::from_write(self.slot_label(&key), move |registry| {
            let slot = collection.slot(registry, &key).ok()?;
            StateWriter::new(slot, None).write(registry, &collection.def.reducer, message)
        })
    }

    /// A message replacing the slot for `key` with `f(current)`.
    pub fn update<F>(&self, key: K, f: F) -> StoreMessage
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        let collection = self.clone();
        StoreMessage::from_write(self.slot_label(&key), move |registry| {
            let slot = collection.slot(registry, &key).ok()?;
            let next = f(&slot.value());
            StateWriter::new(slot, None).supply(registry, next);
            None
        })
    }

    /// A message dropping every slot.
    pub fn clear(&self) -> StoreMessage {
        let collection = self.clone();
        StoreMessage::from_write(self.label.to_string(), move |registry| {
            match collection.publisher(registry) {
                Ok(publisher) => {
                    let dropped = publisher.clear(registry);
                    debug!(token = %collection.label, slots = dropped, "collection cleared");
                }
                Err(err) => warn!(token = %collection.label, error = %err, "clear skipped"),
            }
            None
        })
    }

    /// Number of slots currently alive in `registry`.
    pub fn size(&self, registry: &Registry) -> usize {
        self.publisher(registry).map_or(0, |publisher| publisher.len())
    }

    fn publisher(
        &self,
        registry: &Registry,
    ) -> Result<Arc<CollectionPublisher<K, T>>, StoreError> {
        downcast_arc(registry.publisher(self))
    }

    fn slot(
        &self,
        registry: &Registry,
        key: &K,
    ) -> Result<Arc<ContainerPublisher<T>>, StoreError> {
        let publisher = self.publisher(registry).inspect_err(|err| {
            warn!(token = %self.label, error = %err, "slot unavailable");
        })?;
        Ok(publisher.slot(key, &self.def.init))
    }

    fn slot_label(&self, key: &K) -> String {
        format!("{}[{key:?}]", self.label)
    }
}

impl<K, T, M> Clone for Collection<K, T, M> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            def: Arc::clone(&self.def),
        }
    }
}

impl<K, T, M> PartialEq for Collection<K, T, M> {
    fn eq(&self, other: &Self) -> bool {
        self.label.id() == other.label.id()
    }
}

impl<K, T, M> Eq for Collection<K, T, M> {}

impl<K, T, M> fmt::Display for Collection<K, T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label.fmt(f)
    }
}

impl<K, T, M> fmt::Debug for Collection<K, T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Collection").field(&self.label.to_string()).finish()
    }
}

impl<K, T, M> StateToken for Collection<K, T, M>
where
    K: SlotKey,
    T: StateValue,
    M: Send + 'static,
{
    fn label(&self) -> &TokenLabel {
        &self.label
    }

    fn create_publisher(&self, _registry: &Registry) -> Arc<dyn Publisher> {
        Arc::new(CollectionPublisher::<K, T> {
            core: PublisherCore::for_token(NodeKind::Source, &self.label),
            slots: Mutex::new(IndexMap::new()),
        })
    }
}

/// One key of a collection, readable like any other token.
pub struct CollectionKey<K, T, M = T> {
    collection: Collection<K, T, M>,
    key: K,
}

impl<K: Clone, T, M> Clone for CollectionKey<K, T, M> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            key: self.key.clone(),
        }
    }
}

impl<K, T, M> CollectionKey<K, T, M> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, T, M> Readable for CollectionKey<K, T, M>
where
    K: SlotKey,
    T: StateValue,
    M: Send + 'static,
{
    type Value = T;

    fn read(&self, get: &mut Get<'_>) -> Result<T, StoreError> {
        let slot = self.collection.slot(get.registry(), &self.key)?;
        let publisher: Arc<dyn Publisher> = slot.clone();
        get.track(&publisher);
        Ok(slot.value())
    }

    fn bind(&self, _registry: &Registry) -> Arc<dyn Readable<Value = T>> {
        Arc::new(self.clone())
    }

    fn describe(&self) -> String {
        self.collection.slot_label(&self.key)
    }
}

/// Publisher of a collection: the slot table.
pub struct CollectionPublisher<K, T> {
    core: PublisherCore,
    slots: Mutex<IndexMap<K, Arc<ContainerPublisher<T>>>>,
}

impl<K: SlotKey, T: StateValue> CollectionPublisher<K, T> {
    /// The slot for `key`, created from `init` if missing.
    fn slot(&self, key: &K, init: &SlotInit<K, T>) -> Arc<ContainerPublisher<T>> {
        if let Some(slot) = self.slots.lock().get(key) {
            return Arc::clone(slot);
        }

        let initial = init(key);
        let label = format!("{}[{key:?}]", self.core.label());
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(ContainerPublisher::new(
                PublisherCore::new(NodeKind::Source, label),
                initial,
            ))
        });
        Arc::clone(slot)
    }

    /// Drop every slot and its listener list. Returns how many were dropped.
    fn clear(&self, registry: &Registry) -> usize {
        let dropped = std::mem::take(&mut *self.slots.lock());
        for slot in dropped.values() {
            registry.orphan(slot.core());
        }
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<K: SlotKey, T: StateValue> Publisher for CollectionPublisher<K, T> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Derived, Effect};
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn slots_start_from_initializer() {
        let registry = Registry::new();
        let lengths = Collection::new(|name: &String| name.len());

        assert_eq!(registry.get(&lengths.key("abc".to_string())), 3);
        assert_eq!(registry.get(&lengths.key("hello".to_string())), 5);
        assert_eq!(lengths.size(&registry), 2);
    }

    #[test]
    fn slots_are_independent() {
        let registry = Registry::new();
        let scores = Collection::new(|_: &u32| 0);
        let runs = Arc::new(AtomicI32::new(0));

        let first = scores.key(1);
        let runs_clone = runs.clone();
        let _sub = registry.use_effect(Effect::new(move |get| {
            get.get(&first);
            runs_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(scores.write(2, 10));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        registry.dispatch(scores.write(1, 5));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get(&scores.key(1)), 5);
        assert_eq!(registry.get(&scores.key(2)), 10);
    }

    #[test]
    fn update_applies_function() {
        let registry = Registry::new();
        let counters = Collection::new(|_: &&str| 1);

        registry.dispatch(counters.update("a", |n| n * 10));
        registry.dispatch(counters.update("a", |n| n + 1));
        assert_eq!(registry.get(&counters.key("a")), 11);
    }

    #[test]
    fn reducer_applies_per_slot() {
        let registry = Registry::new();
        let totals = Collection::with_reducer(
            |_: &char| 0i64,
            |delta: i64, current: &i64| {
                if delta == 0 {
                    Err(WriteError::new("zero", "empty delta"))
                } else {
                    Ok(Reduced::new(current + delta))
                }
            },
        );

        registry.dispatch(totals.write('x', 3));
        registry.dispatch(totals.write('x', 4));
        registry.dispatch(totals.write('x', 0));
        assert_eq!(registry.get(&totals.key('x')), 7);
    }

    #[test]
    fn clear_resets_slots() {
        let registry = Registry::new();
        let drafts = Collection::new(|_: &u8| String::new());

        registry.dispatch(drafts.write(1, "hello".into()));
        assert_eq!(registry.get(&drafts.key(1)), "hello");

        registry.dispatch(drafts.clear());
        assert_eq!(drafts.size(&registry), 0);
        assert_eq!(registry.get(&drafts.key(1)), "");
    }

    #[test]
    fn derived_rereads_slot_after_clear() {
        let registry = Registry::new();
        let scores = Collection::new(|_: &u8| 0);
        let key = scores.key(1);
        let scaled = Derived::new(move |get| get.get(&key) * 10);

        registry.dispatch(scores.write(1, 5));
        assert_eq!(registry.get(&scaled), 50);

        registry.dispatch(scores.clear());
        assert_eq!(registry.get(&scaled), 0);

        registry.dispatch(scores.write(1, 7));
        assert_eq!(registry.get(&scores.key(1)), 7);
        assert_eq!(registry.get(&scaled), 70);
    }

    #[test]
    fn clear_reaches_effects_behind_derivations() {
        let registry = Registry::new();
        let scores = Collection::new(|_: &u8| 1);
        let key = scores.key(1);
        let scaled = Derived::new(move |get| get.get(&key) * 10);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = registry.subscribe(&scaled, move |n| seen_clone.lock().push(n));

        registry.dispatch(scores.write(1, 4));
        registry.dispatch(scores.clear());
        registry.dispatch(scores.write(1, 2));

        assert_eq!(*seen.lock(), vec![10, 40, 10, 20]);
    }

    #[test]
    fn key_display() {
        let todos = Collection::new(|_: &u32| false).named("todos").with_key("t");
        assert_eq!(todos.key(7).describe(), "todos-t[7]");
    }
}
