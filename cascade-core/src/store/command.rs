//! Rules, selections and commands.
//!
//! These are named, reusable actions triggered imperatively instead of being
//! bound to data. Each trigger is evaluated once against the current graph,
//! untracked, and whatever it produces goes through the normal write
//! pipeline in the same transaction. None of them subscribes to anything.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::WriteError;
use crate::reactive::{Container, Get, MetaState, Readable, StateValue, TokenKind, TokenLabel};

use super::message::{Invocation, StoreMessage};
use super::registry::Registry;
use super::task::Task;

type RuleFn<A> = Arc<dyn Fn(&mut Get<'_>, A) -> StoreMessage + Send + Sync>;

/// Action computing a message from the current graph and its arguments.
///
/// # Example
///
/// ```rust,ignore
/// let count = Container::new(1);
/// let c = count.clone();
/// let cycle = Rule::new(move |get, ()| c.write((get.get(&c) + 1) % 3));
///
/// registry.dispatch(cycle.trigger(()));
/// ```
pub struct Rule<A> {
    label: TokenLabel,
    f: RuleFn<A>,
}

impl<A: Send + 'static> Rule<A> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Get<'_>, A) -> StoreMessage + Send + Sync + 'static,
    {
        Self {
            label: TokenLabel::new(TokenKind::Rule),
            f: Arc::new(f),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.label.set_name(name);
        self
    }

    /// A message evaluating the rule with `args` when applied.
    pub fn trigger(&self, args: A) -> StoreMessage {
        let f = Arc::clone(&self.f);
        StoreMessage::Exec(Invocation::new(self.label.to_string(), move |registry| {
            let mut get = Get::untracked(registry);
            Some(f(&mut get, args))
        }))
    }
}

impl<A> Clone for Rule<A> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            f: Arc::clone(&self.f),
        }
    }
}

impl<A> fmt::Debug for Rule<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rule").field(&self.label.to_string()).finish()
    }
}

/// Rule bound to one readable token: its function receives that token's
/// current value instead of a [`Get`].
pub struct Selection<T, A> {
    label: TokenLabel,
    source: Arc<dyn Readable<Value = T>>,
    f: Arc<dyn Fn(T, A) -> StoreMessage + Send + Sync>,
}

impl<T: StateValue, A: Send + 'static> Selection<T, A> {
    pub fn new<R, F>(source: R, f: F) -> Self
    where
        R: Readable<Value = T>,
        F: Fn(T, A) -> StoreMessage + Send + Sync + 'static,
    {
        Self {
            label: TokenLabel::new(TokenKind::Selection),
            source: Arc::new(source),
            f: Arc::new(f),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.label.set_name(name);
        self
    }

    pub fn trigger(&self, args: A) -> StoreMessage {
        let source = Arc::clone(&self.source);
        let f = Arc::clone(&self.f);
        StoreMessage::Exec(Invocation::new(self.label.to_string(), move |registry| {
            let value = Get::untracked(registry).get(&*source);
            Some(f(value, args))
        }))
    }
}

impl<T, A> Clone for Selection<T, A> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            source: Arc::clone(&self.source),
            f: Arc::clone(&self.f),
        }
    }
}

type Handler<P> = Arc<dyn Fn(&mut CommandActions<'_>, P) + Send + Sync>;

/// Imperative action with direct access to container values and meta
/// states through [`CommandActions`].
pub struct Command<P> {
    label: TokenLabel,
    handler: Handler<P>,
}

impl<P: Send + 'static> Command<P> {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut CommandActions<'_>, P) + Send + Sync + 'static,
    {
        Self {
            label: TokenLabel::new(TokenKind::Command),
            handler: Arc::new(handler),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.label.set_name(name);
        self
    }

    /// A message running the handler with `payload`.
    pub fn invoke(&self, payload: P) -> StoreMessage {
        let handler = Arc::clone(&self.handler);
        let origin = self.label.to_string();
        StoreMessage::Exec(Invocation::new(origin.clone(), move |registry| {
            let mut actions = CommandActions::new(registry, origin);
            handler(&mut actions, payload);
            actions.into_follow_up()
        }))
    }
}

impl<P> Clone for Command<P> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<P> fmt::Debug for Command<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Command").field(&self.label.to_string()).finish()
    }
}

/// What a command handler (or its deferred continuation) may do.
pub struct CommandActions<'r> {
    registry: &'r Registry,
    origin: String,
    follow_ups: Vec<StoreMessage>,
}

impl<'r> CommandActions<'r> {
    fn new(registry: &'r Registry, origin: String) -> Self {
        Self {
            registry,
            origin,
            follow_ups: Vec::new(),
        }
    }

    /// Read a token's current value.
    pub fn get<R: Readable + ?Sized>(&self, token: &R) -> R::Value {
        Get::untracked(self.registry).get(token)
    }

    /// Commit `value` to `container` directly (no reducer or hook) and set
    /// its meta state to `Ok`.
    pub fn supply<T, M>(&self, container: &Container<T, M>, value: T)
    where
        T: StateValue,
        M: Send + 'static,
    {
        match container.writer(self.registry) {
            Ok(writer) => writer.supply(self.registry, value),
            Err(err) => warn!(command = %self.origin, error = %err, "supply skipped"),
        }
    }

    /// Mark `container` as waiting on this command.
    pub fn pending<T, M>(&self, container: &Container<T, M>, message: &str)
    where
        T: StateValue,
        M: Send + 'static,
    {
        self.registry.set_meta(&container.meta(), MetaState::pending(message));
    }

    /// Report a failure on `container` without touching its value.
    pub fn error<T, M>(&self, container: &Container<T, M>, reason: &str, message: &str)
    where
        T: StateValue,
        M: Send + 'static,
    {
        match container.writer(self.registry) {
            Ok(writer) => writer.reject(self.registry, WriteError::new(reason, message)),
            Err(err) => warn!(command = %self.origin, error = %err, "error report skipped"),
        }
    }

    /// Reset `container`'s meta state to `Ok` without writing a value.
    pub fn ok<T, M>(&self, container: &Container<T, M>)
    where
        T: StateValue,
        M: Send + 'static,
    {
        self.registry.set_meta(&container.meta(), MetaState::Ok);
    }

    /// Apply `message` right after the handler returns, in the same cycle.
    pub fn dispatch(&mut self, message: StoreMessage) {
        self.follow_ups.push(message);
    }

    /// Resume `continuation` later, from
    /// [`Registry::run_tasks`](super::Registry::run_tasks).
    pub fn defer<F>(&self, continuation: F)
    where
        F: FnOnce(&mut CommandActions<'_>) + Send + 'static,
    {
        let origin = self.origin.clone();
        self.registry
            .enqueue_task(Task::new(&self.origin, move |registry| {
                let mut actions = CommandActions::new(registry, origin);
                continuation(&mut actions);
                actions.into_follow_up()
            }));
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    fn into_follow_up(mut self) -> Option<StoreMessage> {
        match self.follow_ups.len() {
            0 => None,
            1 => self.follow_ups.pop(),
            _ => Some(StoreMessage::Batch(self.follow_ups)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
