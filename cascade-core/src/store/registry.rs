//! Token Registry
//!
//! The registry is one isolated state graph. It maps tokens to the
//! publishers it created for them, owns the subscriber arena, and drives the
//! notify/run cycle.
//!
//! # How It Works
//!
//! 1. The first time a token is touched, the registry asks the token to
//!    build its publisher and installs it. Later lookups return the same
//!    publisher.
//!
//! 2. Every public entry point runs inside a transaction. Commits made
//!    inside it walk listener lists right away (notify phase), but effects
//!    are only queued.
//!
//! 3. When the outermost transaction closes, the registry settles: it runs
//!    the queued effects round by round until no more are queued.
//!
//! # Thread Safety
//!
//! `Registry` is `Send + Sync` and cheap to clone. Every entry point takes a
//! re-entrant cycle lock, so dispatch cycles never interleave across threads
//! while hooks and effects may call back into the registry on the same
//! thread. Internal locks are never held while user code runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::config::RegistryConfig;
use crate::error::StoreError;
use crate::graph::{Listener, Notified, SubscriberArena, SubscriberId, UpdateScheduler};
use crate::reactive::{
    Derived, Effect, EffectNode, Get, MetaState, MetaToken, Publisher, PublisherCore,
    PublisherRef, Readable, StateToken, StateValue, Subscription, TokenId,
};

use super::task::Task;

/// Shared state behind a [`Registry`] handle.
pub(crate) struct RegistryInner {
    config: RegistryConfig,
    publishers: DashMap<TokenId, Arc<dyn Publisher>>,
    arena: Mutex<SubscriberArena>,
    scheduler: Mutex<UpdateScheduler>,
    tasks: Mutex<VecDeque<Task>>,
    epoch: AtomicU64,
    cycle: ReentrantMutex<()>,
    disposed: AtomicBool,
}

impl RegistryInner {
    /// Drop a subscriber. Its listener entries go stale.
    ///
    /// Ids issued before a dispose belong to the discarded arena and are
    /// ignored.
    pub(crate) fn remove_subscriber(&self, id: SubscriberId) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let listener = self.arena.lock().remove(id);
        // Dropped here, after the arena lock is released
        drop(listener);
    }
}

/// An isolated state graph.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name())
            .field("publishers", &self.inner.publishers.len())
            .field("subscribers", &self.inner.arena.lock().len())
            .field("pending_effects", &self.inner.scheduler.lock().pending_count())
            .field("pending_tasks", &self.pending_tasks())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Closes a transaction when unwinding out of it.
struct TransactionGuard<'a> {
    scheduler: &'a Mutex<UpdateScheduler>,
    open: bool,
}

impl<'a> TransactionGuard<'a> {
    fn begin(scheduler: &'a Mutex<UpdateScheduler>) -> Self {
        scheduler.lock().begin();
        Self {
            scheduler,
            open: true,
        }
    }

    /// Returns `true` if this closed the outermost transaction.
    fn end(mut self) -> bool {
        self.open = false;
        self.scheduler.lock().end()
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let mut scheduler = self.scheduler.lock();
        if scheduler.end() {
            let dropped = scheduler.discard_pending();
            scheduler.finish_settle();
            warn!(dropped, "transaction aborted, pending effects dropped");
        }
    }
}

/// Marks the settle loop finished even if an effect panics.
struct SettleGuard<'a> {
    scheduler: &'a Mutex<UpdateScheduler>,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        let mut scheduler = self.scheduler.lock();
        if std::thread::panicking() {
            scheduler.discard_pending();
        }
        scheduler.finish_settle();
    }
}

impl Registry {
    /// Create a registry with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        debug!(registry = %config.display_name(), "registry created");
        Self {
            inner: Arc::new(RegistryInner {
                config,
                publishers: DashMap::new(),
                arena: Mutex::new(SubscriberArena::new()),
                scheduler: Mutex::new(UpdateScheduler::new()),
                tasks: Mutex::new(VecDeque::new()),
                epoch: AtomicU64::new(0),
                cycle: ReentrantMutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub(crate) fn name(&self) -> &str {
        self.inner.config.display_name()
    }

    // ---- Reads ----

    /// The publisher behind `token`, created on first access.
    pub fn get_state<S: StateToken>(&self, token: &S) -> PublisherRef {
        let _cycle = self.inner.cycle.lock();
        PublisherRef(self.publisher(token))
    }

    /// Read the current value of `token`, pulling derived values up to date.
    ///
    /// # Panics
    ///
    /// Panics on a cyclic derivation. See [`Registry::try_get`].
    pub fn get<R: Readable + ?Sized>(&self, token: &R) -> R::Value {
        let _cycle = self.inner.cycle.lock();
        Get::untracked(self).get(token)
    }

    pub fn try_get<R: Readable + ?Sized>(&self, token: &R) -> Result<R::Value, StoreError> {
        let _cycle = self.inner.cycle.lock();
        Get::untracked(self).try_get(token)
    }

    /// Error of the latest run of `derived`, if it failed.
    pub fn derivation_error<T: StateValue>(&self, derived: &Derived<T>) -> Option<String> {
        let _cycle = self.inner.cycle.lock();
        derived.last_error(self)
    }

    // ---- Subscriptions ----

    /// Register an effect. It runs (or its `init` runs) before this returns.
    pub fn use_effect(&self, effect: Effect) -> Subscription {
        if self.is_disposed() {
            warn!(registry = %self.name(), "effect registered on a disposed registry");
            return Subscription::inert(effect);
        }

        let _cycle = self.inner.cycle.lock();
        let node = Arc::new(EffectNode::new(effect));
        let id = self.register_listener(Listener::Effect(Arc::clone(&node)));
        node.bind(id);
        trace!(?id, "effect registered");

        self.transaction(|| node.execute(self));
        Subscription::new(Arc::downgrade(&self.inner), id, node)
    }

    /// Call `listener` with the current value of `token` and again after
    /// every settled change.
    ///
    /// A variable is resolved once, here: the subscription stays on the
    /// token the variable points at right now.
    pub fn subscribe<R, F>(&self, token: &R, mut listener: F) -> Subscription
    where
        R: Readable + ?Sized,
        F: FnMut(R::Value) + Send + 'static,
    {
        let _cycle = self.inner.cycle.lock();
        let bound = token.bind(self);
        self.use_effect(Effect::new(move |get| {
            let value = get.get(&*bound);
            listener(value);
        }))
    }

    // ---- Tasks ----

    /// Resume every task queued so far, oldest first, each in its own
    /// cycle. Tasks queued while running wait for the next call.
    ///
    /// Returns the number of tasks resumed.
    pub fn run_tasks(&self) -> usize {
        if self.is_disposed() {
            return 0;
        }

        let _cycle = self.inner.cycle.lock();
        let tasks: Vec<Task> = self.inner.tasks.lock().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            debug!(registry = %self.name(), origin = %task.origin(), "resuming task");
            let origin = task.origin().to_string();
            self.transaction(|| {
                let follow_up = task.run(self);
                self.cascade(&origin, follow_up, 0);
            });
        }
        count
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub(crate) fn enqueue_task(&self, task: Task) {
        trace!(origin = %task.origin(), "task queued");
        self.inner.tasks.lock().push_back(task);
    }

    // ---- Lifecycle ----

    /// Drop every subscription and queued task. Later dispatches are logged
    /// and ignored; reads keep returning the last values.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _cycle = self.inner.cycle.lock();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let effects = self.inner.scheduler.lock().discard_pending();
        let arena = std::mem::take(&mut *self.inner.arena.lock());
        debug!(
            registry = %self.name(),
            tasks = tasks.len(),
            effects,
            subscribers = arena.len(),
            "registry disposed"
        );
        drop(arena);
        drop(tasks);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    // ---- Engine internals ----

    /// The publisher for `token`, created and installed on first access.
    pub(crate) fn publisher<S: StateToken + ?Sized>(&self, token: &S) -> Arc<dyn Publisher> {
        let id = token.token_id();
        if let Some(existing) = self.inner.publishers.get(&id) {
            return Arc::clone(existing.value());
        }

        let created = token.create_publisher(self);
        let (publisher, fresh) = match self.inner.publishers.entry(id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&created));
                (created, true)
            }
        };

        if fresh {
            trace!(token = %token.label(), "publisher created");
            token.on_created(self, &publisher);
        }
        publisher
    }

    /// Hold off other threads' dispatch cycles without opening a
    /// transaction.
    pub(crate) fn lock_cycle(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.cycle.lock()
    }

    /// Run `f` as a transaction; the outermost one settles on exit.
    pub(crate) fn transaction<R>(&self, f: impl FnOnce() -> R) -> R {
        let _cycle = self.inner.cycle.lock();
        let guard = TransactionGuard::begin(&self.inner.scheduler);
        let result = f();
        if guard.end() {
            self.settle();
        }
        result
    }

    /// Run queued effects until none are left.
    fn settle(&self) {
        let _guard = SettleGuard {
            scheduler: &self.inner.scheduler,
        };
        let limit = self.inner.config.max_settle_rounds;
        let mut rounds = 0;

        loop {
            let pending = self.inner.scheduler.lock().take_pending();
            if pending.is_empty() {
                break;
            }
            rounds += 1;
            if rounds > limit {
                let dropped = pending.len() + self.inner.scheduler.lock().discard_pending();
                let err = StoreError::SettleLimit { rounds: limit };
                warn!(registry = %self.name(), error = %err, dropped, "settle aborted");
                break;
            }

            trace!(round = rounds, effects = pending.len(), "settle round");
            for (id, effect) in pending {
                if !self.inner.arena.lock().contains(id) {
                    continue;
                }
                if let Err(err) = effect.run_if_changed(self) {
                    warn!(?id, error = %err, "effect skipped");
                }
            }
        }
    }

    /// Next value of the registry-wide change stamp.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a value change on `publisher` and notify its listeners.
    pub(crate) fn publish_change(&self, publisher: &dyn Publisher) {
        publisher.core().mark_changed(self.next_epoch());
        self.notify(publisher.core());
    }

    /// Notify phase: mark derivations downstream of `core` maybe-dirty and
    /// queue the effects they feed.
    fn notify(&self, core: &PublisherCore) {
        let listeners = self.live_listeners(core);
        trace!(publisher = %core.label(), listeners = listeners.len(), "notify");

        for listener in listeners {
            match listener {
                Notified::Derivation(derived) => {
                    if derived.invalidate() {
                        self.notify(derived.core());
                    }
                }
                Notified::Effect(id, effect) => self.schedule(id, effect),
            }
        }
    }

    /// Detach a publisher that is being dropped from under its readers.
    ///
    /// Effects reading it directly lose their registration and hear nothing.
    /// Derivations reading it are forced to recompute, and whatever depends
    /// on them is notified as for a normal change.
    pub(crate) fn orphan(&self, core: &PublisherCore) {
        let listeners = self.live_listeners(core);
        core.listeners().clear();
        trace!(publisher = %core.label(), listeners = listeners.len(), "orphan");

        for listener in listeners {
            if let Notified::Derivation(derived) = listener {
                if derived.mark_stale() {
                    self.notify(derived.core());
                }
            }
        }
    }

    fn live_listeners(&self, core: &PublisherCore) -> Vec<Notified> {
        let mut list = core.listeners();
        let arena = self.inner.arena.lock();
        list.collect_live(&arena)
    }

    /// Queue an effect for the next settle round.
    pub(crate) fn schedule(&self, id: SubscriberId, effect: Arc<EffectNode>) {
        self.inner.scheduler.lock().enqueue(id, effect);
    }

    pub(crate) fn register_listener(&self, listener: Listener) -> SubscriberId {
        self.inner.arena.lock().insert(listener)
    }

    pub(crate) fn bump_version(&self, id: SubscriberId) -> Option<u64> {
        self.inner.arena.lock().bump_version(id)
    }

    pub(crate) fn set_meta(&self, meta: &MetaToken, state: MetaState) {
        match meta.publisher(self) {
            Ok(publisher) => {
                if publisher.replace(state) {
                    self.publish_change(publisher.as_ref());
                }
            }
            Err(err) => warn!(token = %meta, error = %err, "meta update skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Container;
    use crate::store::StoreMessage;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn registry_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Registry>();
    }

    #[test]
    fn publisher_is_created_once() {
        let registry = Registry::new();
        let count = Container::new(0);

        let first = registry.get_state(&count);
        let second = registry.get_state(&count);
        assert!(first.ptr_eq(&second));
    }

    #[test]
    fn registries_are_isolated() {
        let left = Registry::new();
        let right = Registry::new();
        let count = Container::new(0);

        left.dispatch(count.write(1));
        assert_eq!(left.get(&count), 1);
        assert_eq!(right.get(&count), 0);
        assert!(!left.get_state(&count).ptr_eq(&right.get_state(&count)));
    }

    #[test]
    fn change_stamps_increase() {
        let registry = Registry::new();
        let count = Container::new(0);

        registry.dispatch(count.write(1));
        let first = registry.get_state(&count).changed_at();
        registry.dispatch(count.write(1));
        let second = registry.get_state(&count).changed_at();
        assert!(second > first);
    }

    #[test]
    fn settle_limit_stops_runaway_effects() {
        let registry = Registry::with_config(RegistryConfig::default().with_max_settle_rounds(5));
        let count = Container::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let runs_clone = runs.clone();
        let _sub = registry.use_effect(Effect::new(move |get| {
            let n = get.get(&count_clone);
            runs_clone.fetch_add(1, Ordering::SeqCst);
            get.registry().dispatch(count_clone.write(n + 1));
        }));

        // First run plus five settle rounds
        assert_eq!(runs.load(Ordering::SeqCst), 6);

        // The registry is usable afterwards
        registry.dispatch(count.write(100));
        assert!(registry.get(&count) >= 100);
    }

    #[test]
    fn dispose_drops_subscriptions_and_tasks() {
        let registry = Registry::new();
        let count = Container::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let runs_clone = runs.clone();
        let _sub = registry.use_effect(Effect::new(move |get| {
            get.get(&count_clone);
            runs_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispose();
        assert!(registry.is_disposed());

        registry.dispatch(count.write(5));
        assert_eq!(registry.get(&count), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.run_tasks(), 0);

        let late = registry.use_effect(Effect::new(|_| {}));
        assert!(!late.is_active());
        assert_eq!(late.run_count(), 0);
    }

    #[test]
    fn nested_dispatch_settles_once() {
        let registry = Registry::new();
        let a = Container::new(0);
        let b = Container::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (a_clone, b_clone) = (a.clone(), b.clone());
        let seen_clone = seen.clone();
        let _sub = registry.use_effect(Effect::new(move |get| {
            seen_clone.lock().push((get.get(&a_clone), get.get(&b_clone)));
        }));

        let b_inner = b.clone();
        registry.dispatch(StoreMessage::batch([
            a.write(1),
            StoreMessage::run(move |registry| registry.dispatch(b_inner.write(2))),
        ]));

        assert_eq!(*seen.lock(), vec![(0, 0), (1, 2)]);
    }
}
