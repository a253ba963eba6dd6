//! Effect Implementation
//!
//! An effect is a user callback that runs whenever the values it read on
//! its last run change. Effects are the leaves of the graph: nothing
//! depends on them.
//!
//! # How Effects Work
//!
//! 1. When registered, the effect runs once inside a transaction to record
//!    its initial dependencies. If an `init` callback was given, that runs
//!    instead and `run` waits for the first change.
//!
//! 2. A write reaching one of its dependencies queues the effect. It is not
//!    run during the notify walk.
//!
//! 3. In the run phase the registry pulls every dependency up to date and
//!    runs the effect only if one of them actually changed. Each run
//!    re-records the dependency set and bumps the subscriber version, which
//!    turns the previous run's listener entries stale.
//!
//! # Differences from Derived
//!
//! - Derived values are lazy and memoized; effects are eager.
//! - Effects are owned by the registry's subscriber arena and stay alive
//!   until their [`Subscription`] is dropped or unsubscribed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::StoreError;
use crate::graph::{Dependency, ListenerEntry, NodeKind, NodeState, SubscriberId};
use crate::store::{Registry, RegistryInner};

use super::context::Get;

type InitFn = Box<dyn FnOnce(&mut Get<'_>) + Send>;
type RunFn = Box<dyn FnMut(&mut Get<'_>) + Send>;

/// A side-effecting computation to register with
/// [`Registry::use_effect`](crate::store::Registry::use_effect).
///
/// # Example
///
/// ```rust,ignore
/// let count = Container::new(0);
/// let c = count.clone();
///
/// let _sub = registry.use_effect(Effect::new(move |get| {
///     println!("count is {}", get.get(&c));
/// }));
///
/// registry.dispatch(count.write(5)); // prints "count is 5"
/// ```
pub struct Effect {
    init: Option<InitFn>,
    run: RunFn,
}

impl Effect {
    /// An effect that runs immediately and then on every change.
    pub fn new<F>(run: F) -> Self
    where
        F: FnMut(&mut Get<'_>) + Send + 'static,
    {
        Self {
            init: None,
            run: Box::new(run),
        }
    }

    /// Run `init` once on registration instead of `run`.
    ///
    /// The dependencies read by `init` decide when `run` first fires.
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnOnce(&mut Get<'_>) + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }
}

/// A registered effect, as stored in the subscriber arena.
pub(crate) struct EffectNode {
    id: OnceLock<SubscriberId>,
    init: Mutex<Option<InitFn>>,
    run: Mutex<Option<RunFn>>,
    node: Mutex<NodeState>,
    run_count: AtomicUsize,
}

impl EffectNode {
    pub fn new(effect: Effect) -> Self {
        Self {
            id: OnceLock::new(),
            init: Mutex::new(effect.init),
            run: Mutex::new(Some(effect.run)),
            node: Mutex::new(NodeState::new(NodeKind::Effect)),
            run_count: AtomicUsize::new(0),
        }
    }

    pub fn bind(&self, id: SubscriberId) {
        let _ = self.id.set(id);
    }

    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::Acquire)
    }

    /// Pull every dependency up to date and run if one of them changed.
    ///
    /// Returns whether the effect ran.
    pub fn run_if_changed(self: &Arc<Self>, registry: &Registry) -> Result<bool, StoreError> {
        let dependencies: Vec<_> = self.node.lock().dependencies().to_vec();

        let mut changed = false;
        for dependency in &dependencies {
            dependency.publisher.refresh(registry)?;
            if dependency.has_changed() {
                changed = true;
            }
        }

        if changed {
            self.execute(registry);
        } else {
            self.node.lock().mark_clean();
        }
        Ok(changed)
    }

    /// Run the effect now and re-record its dependencies.
    ///
    /// If the run itself changed something it read, the effect is queued
    /// again for the next round.
    pub fn execute(self: &Arc<Self>, registry: &Registry) {
        let Some(id) = self.id.get().copied() else {
            return;
        };
        let Some(version) = registry.bump_version(id) else {
            // Unsubscribed while queued
            return;
        };

        let mut get = Get::tracking(registry);
        let init = self.init.lock().take();
        match init {
            Some(init) => init(&mut get),
            None => {
                let Some(mut run) = self.run.lock().take() else {
                    trace!(?id, "effect already running");
                    return;
                };
                run(&mut get);
                *self.run.lock() = Some(run);
            }
        }

        let dependencies = get.into_dependencies();
        let entry = ListenerEntry {
            subscriber: id,
            version,
        };
        for dependency in &dependencies {
            dependency.publisher.core().listeners().push_effect(entry);
        }
        let stale = dependencies.iter().any(Dependency::has_changed);

        {
            let mut node = self.node.lock();
            node.set_dependencies(dependencies);
            node.mark_clean();
        }
        self.run_count.fetch_add(1, Ordering::AcqRel);

        if stale {
            trace!(?id, "effect changed its own input, queued again");
            registry.schedule(id, Arc::clone(self));
        }
    }
}

/// Handle to a registered effect or subscription.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep
/// the effect alive for as long as the registry lives.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    id: Option<SubscriberId>,
    node: Arc<EffectNode>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        registry: Weak<RegistryInner>,
        id: SubscriberId,
        node: Arc<EffectNode>,
    ) -> Self {
        Self {
            registry,
            id: Some(id),
            node,
            active: AtomicBool::new(true),
        }
    }

    /// A subscription that never fires (returned by a disposed registry).
    pub(crate) fn inert(effect: Effect) -> Self {
        Self {
            registry: Weak::new(),
            id: None,
            node: Arc::new(EffectNode::new(effect)),
            active: AtomicBool::new(false),
        }
    }

    /// Number of times the effect has run (its first run included).
    pub fn run_count(&self) -> usize {
        self.node.run_count()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the effect. Its listener entries go stale and are pruned on the
    /// next walk of each publisher.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let (Some(inner), Some(id)) = (self.registry.upgrade(), self.id) {
            inner.remove_subscriber(id);
        }
    }

    /// Keep the effect registered for the lifetime of the registry.
    pub fn detach(self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("run_count", &self.run_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
