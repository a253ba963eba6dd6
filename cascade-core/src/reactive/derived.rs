//! Derived Implementation
//!
//! A derived token is a memoized value computed from other tokens.
//!
//! # How Derived Values Work
//!
//! 1. Nothing is computed until the value is read, by an effect, another
//!    derivation or a plain registry read.
//!
//! 2. The generator receives a tracking [`Get`]; every token it reads
//!    becomes a dependency for the next cycle, and only those. A token read
//!    in a branch that did not execute is not a dependency.
//!
//! 3. A write upstream marks the derivation "maybe dirty" without running
//!    anything.
//!
//! 4. On the next read the derivation pulls its dependencies. If none of
//!    their change stamps moved, it goes back to clean without recomputing.
//!
//! 5. A recomputation that lands on an equal value does not bump the change
//!    stamp, so dependents further down skip the cycle.
//!
//! # Failures
//!
//! A fallible generator that returns `Err` keeps the previous value (or the
//! fallback on the very first run), records the error and logs it.
//! Dependents see no change.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{BoxError, StoreError};
use crate::graph::{
    Dependency, DirtyState, Listener, ListenerEntry, NodeKind, NodeState, SubscriberId,
};
use crate::store::Registry;

use super::context::Get;
use super::publisher::{downcast, downcast_arc, Publisher, PublisherCore};
use super::token::{Readable, StateToken, StateValue, TokenKind, TokenLabel};

type Generator<T> = Arc<dyn Fn(&mut Get<'_>) -> Result<T, BoxError> + Send + Sync>;

struct DerivedDef<T> {
    generator: Generator<T>,
    fallback: Option<T>,
}

/// Read-only token computed from other tokens.
///
/// # Example
///
/// ```rust,ignore
/// let count = Container::new(2);
/// let c = count.clone();
/// let doubled = Derived::new(move |get| get.get(&c) * 2);
///
/// assert_eq!(registry.get(&doubled), 4);
/// ```
pub struct Derived<T> {
    label: TokenLabel,
    def: Arc<DerivedDef<T>>,
}

impl<T: StateValue> Derived<T> {
    /// A derivation from an infallible generator.
    pub fn new<F>(generator: F) -> Self
    where
        F: Fn(&mut Get<'_>) -> T + Send + Sync + 'static,
    {
        Self::build(
            None,
            Arc::new(move |get: &mut Get<'_>| Ok::<T, BoxError>(generator(get))),
        )
    }

    /// A derivation whose generator may fail.
    ///
    /// `fallback` is the value until the first successful run.
    pub fn try_new<F>(fallback: T, generator: F) -> Self
    where
        F: Fn(&mut Get<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self::build(Some(fallback), Arc::new(generator))
    }

    fn build(fallback: Option<T>, generator: Generator<T>) -> Self {
        Self {
            label: TokenLabel::new(TokenKind::Derived),
            def: Arc::new(DerivedDef {
                generator,
                fallback,
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

    /// Last generator failure in `registry`, if the latest run failed.
    pub(crate) fn last_error(&self, registry: &Registry) -> Option<String> {
        let publisher = downcast_arc::<DerivedPublisher<T>>(registry.publisher(self)).ok()?;
        let error = publisher.state.lock().last_error.clone();
        error
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            def: Arc::clone(&self.def),
        }
    }
}

impl<T> PartialEq for Derived<T> {
    fn eq(&self, other: &Self) -> bool {
        self.label.id() == other.label.id()
    }
}

impl<T> Eq for Derived<T> {}

impl<T> fmt::Display for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label.fmt(f)
    }
}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Derived").field(&self.label.to_string()).finish()
    }
}

impl<T: StateValue> StateToken for Derived<T> {
    fn label(&self) -> &TokenLabel {
        &self.label
    }

    fn create_publisher(&self, _registry: &Registry) -> Arc<dyn Publisher> {
        let publisher: Arc<DerivedPublisher<T>> = Arc::new_cyclic(|this| DerivedPublisher {
            core: PublisherCore::for_token(NodeKind::Derived, &self.label),
            this: this.clone(),
            def: Arc::clone(&self.def),
            subscriber: OnceLock::new(),
            state: Mutex::new(DerivedState {
                node: NodeState::new(NodeKind::Derived),
                value: None,
                computing: false,
                last_error: None,
            }),
        });
        publisher
    }
}

impl<T: StateValue> Readable for Derived<T> {
    type Value = T;

    fn read(&self, get: &mut Get<'_>) -> Result<T, StoreError> {
        let registry = get.registry();
        let publisher = registry.publisher(self);
        publisher.refresh(registry)?;
        get.track(&publisher);

        let derived = downcast::<DerivedPublisher<T>>(&*publisher)?;
        let state = derived.state.lock();
        state.value.clone().ok_or_else(|| StoreError::Derivation {
            token: self.label.to_string(),
            reason: state.last_error.clone().unwrap_or_default(),
        })
    }

    fn bind(&self, _registry: &Registry) -> Arc<dyn Readable<Value = T>> {
        Arc::new(self.clone())
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

struct DerivedState<T> {
    node: NodeState,
    value: Option<T>,
    computing: bool,
    last_error: Option<String>,
}

/// Publisher of a derived token.
pub struct DerivedPublisher<T> {
    core: PublisherCore,
    this: Weak<DerivedPublisher<T>>,
    def: Arc<DerivedDef<T>>,
    subscriber: OnceLock<SubscriberId>,
    state: Mutex<DerivedState<T>>,
}

/// Clears the `computing` flag even if the generator panics.
struct ComputeGuard<'a, T>(&'a Mutex<DerivedState<T>>);

impl<T> Drop for ComputeGuard<'_, T> {
    fn drop(&mut self) {
        self.0.lock().computing = false;
    }
}

impl<T: StateValue> DerivedPublisher<T> {
    pub fn dirty_state(&self) -> DirtyState {
        self.state.lock().node.dirty_state()
    }

    fn update(
        &self,
        registry: &Registry,
        check: Option<Vec<Dependency>>,
    ) -> Result<(), StoreError> {
        if let Some(dependencies) = check {
            let mut changed = false;
            for dependency in &dependencies {
                dependency.publisher.refresh(registry)?;
                if dependency.has_changed() {
                    changed = true;
                    break;
                }
            }
            if !changed {
                trace!(token = %self.core.label(), "inputs unchanged");
                self.state.lock().node.mark_clean();
                return Ok(());
            }
        }
        self.recompute(registry);
        Ok(())
    }

    fn recompute(&self, registry: &Registry) {
        let id = *self.subscriber.get_or_init(|| {
            let this: Weak<dyn Publisher> = self.this.clone();
            registry.register_listener(Listener::Derivation(this))
        });
        let version = registry.bump_version(id).unwrap_or_default();

        let mut get = Get::tracking(registry);
        let result = (self.def.generator)(&mut get);
        let dependencies = get.into_dependencies();

        let entry = ListenerEntry {
            subscriber: id,
            version,
        };
        for dependency in &dependencies {
            dependency.publisher.core().listeners().push_derivation(entry);
        }

        let mut state = self.state.lock();
        state.node.set_dependencies(dependencies);
        state.node.mark_clean();

        match result {
            Ok(value) => {
                state.last_error = None;
                if state.value.as_ref() != Some(&value) {
                    state.value = Some(value);
                    self.core.mark_changed(registry.next_epoch());
                }
            }
            Err(err) => {
                warn!(
                    token = %self.core.label(),
                    error = %err,
                    "derivation failed, keeping previous value"
                );
                if state.value.is_none() {
                    state.value = self.def.fallback.clone();
                }
                state.last_error = Some(err.to_string());
            }
        }
    }
}

impl<T: StateValue> Publisher for DerivedPublisher<T> {
    fn core(&self) -> &PublisherCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn refresh(&self, registry: &Registry) -> Result<(), StoreError> {
        let check = {
            let mut state = self.state.lock();
            if state.computing {
                return Err(StoreError::Cycle {
                    token: self.core.label().to_string(),
                });
            }
            let check = match state.node.dirty_state() {
                DirtyState::Clean => return Ok(()),
                DirtyState::Dirty => None,
                DirtyState::MaybeDirty => Some(state.node.dependencies().to_vec()),
            };
            state.computing = true;
            check
        };

        let _guard = ComputeGuard(&self.state);
        self.update(registry, check)
    }

    fn invalidate(&self) -> bool {
        self.state.lock().node.mark_maybe_dirty()
    }

    fn mark_stale(&self) -> bool {
        let mut state = self.state.lock();
        let was_clean = state.node.dirty_state() == DirtyState::Clean;
        state.node.mark_dirty();
        was_clean
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Container;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn derived_computes_on_read() {
        let registry = Registry::new();
        let count = Container::new(5);
        let count_clone = count.clone();
        let doubled = Derived::new(move |get| get.get(&count_clone) * 2);

        assert_eq!(registry.get(&doubled), 10);
        registry.dispatch(count.write(7));
        assert_eq!(registry.get(&doubled), 14);
    }

    #[test]
    fn derived_caches_value() {
        let registry = Registry::new();
        let count = Container::new(1);
        let calls = Arc::new(AtomicI32::new(0));

        let count_clone = count.clone();
        let calls_clone = calls.clone();
        let plus_one = Derived::new(move |get| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            get.get(&count_clone) + 1
        });

        assert_eq!(registry.get(&plus_one), 2);
        assert_eq!(registry.get(&plus_one), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.dispatch(count.write(2));
        assert_eq!(registry.get(&plus_one), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_alone_does_not_recompute() {
        let registry = Registry::new();
        let count = Container::new(1);
        let calls = Arc::new(AtomicI32::new(0));

        let count_clone = count.clone();
        let calls_clone = calls.clone();
        let squared = Derived::new(move |get| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let n = get.get(&count_clone);
            n * n
        });

        registry.get(&squared);
        registry.dispatch(count.write(2));
        registry.dispatch(count.write(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let publisher = registry.get_state(&squared);
        assert_eq!(publisher.kind(), NodeKind::Derived);
        assert_eq!(registry.get(&squared), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_value_stops_propagation() {
        let registry = Registry::new();
        let count = Container::new(2);
        let downstream_calls = Arc::new(AtomicI32::new(0));

        let count_clone = count.clone();
        let is_even = Derived::new(move |get| get.get(&count_clone) % 2 == 0);

        let even_clone = is_even.clone();
        let calls_clone = downstream_calls.clone();
        let label = Derived::new(move |get| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if get.get(&even_clone) { "even" } else { "odd" }
        });

        assert_eq!(registry.get(&label), "even");
        registry.dispatch(count.write(4));
        assert_eq!(registry.get(&label), "even");
        assert_eq!(downstream_calls.load(Ordering::SeqCst), 1);

        registry.dispatch(count.write(5));
        assert_eq!(registry.get(&label), "odd");
        assert_eq!(downstream_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_generator_keeps_previous_value() {
        let registry = Registry::new();
        let input = Container::new(String::from("4"));
        let input_clone = input.clone();
        let parsed = Derived::try_new(0, move |get| {
            let text = get.get(&input_clone);
            Ok(text.parse::<i32>()?)
        });

        assert_eq!(registry.get(&parsed), 4);
        assert_eq!(registry.derivation_error(&parsed), None);

        registry.dispatch(input.write("four".into()));
        assert_eq!(registry.get(&parsed), 4);
        assert!(registry.derivation_error(&parsed).is_some());

        registry.dispatch(input.write("5".into()));
        assert_eq!(registry.get(&parsed), 5);
        assert_eq!(registry.derivation_error(&parsed), None);
    }

    #[test]
    fn first_failure_uses_fallback() {
        let registry = Registry::new();
        let broken = Derived::try_new(-1, |_| Err("unavailable".into()));

        assert_eq!(registry.get(&broken), -1);
        assert_eq!(
            registry.derivation_error(&broken).as_deref(),
            Some("unavailable")
        );
    }

    #[test]
    fn self_read_is_a_cycle() {
        let registry = Registry::new();
        let cell: Arc<OnceLock<Derived<i32>>> = Arc::new(OnceLock::new());

        let cell_clone = cell.clone();
        let looping = Derived::new(move |get| match cell_clone.get() {
            Some(me) => get.try_get(me).map(|n| n + 1).unwrap_or(-1),
            None => 0,
        });
        let _ = cell.set(looping.clone());

        assert_eq!(registry.get(&looping), -1);
        // The flag is cleared again after the run
        assert!(registry.try_get(&looping).is_ok());
    }

    #[test]
    fn derived_chain() {
        let registry = Registry::new();
        let a = Container::new(1);

        let a_clone = a.clone();
        let b = Derived::new(move |get| get.get(&a_clone) * 2);
        let b_clone = b.clone();
        let c = Derived::new(move |get| get.get(&b_clone) + 1);

        assert_eq!(registry.get(&c), 3);
        registry.dispatch(a.write(5));
        assert_eq!(registry.get(&c), 11);
    }
}
