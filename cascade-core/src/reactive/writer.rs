//! State writer.
//!
//! The writer is the one place where a container-like publisher changes
//! value. It runs the reducer and hook, commits, drives the meta state and
//! turns suspended hooks into queued tasks. Containers, collection slots,
//! command actions and snapshot restores all go through it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::WriteError;
use crate::store::{Registry, StoreMessage, Task};

use super::container::{
    ContainerPublisher, HookOutcome, Initializer, Reduced, Reducer, Suspended, WriteHook,
};
use super::context::Get;
use super::meta::{MetaState, MetaToken};
use super::publisher::Publisher;
use super::token::StateValue;

/// Mutation handle for one container-like publisher.
pub(crate) struct StateWriter<T> {
    publisher: Arc<ContainerPublisher<T>>,
    meta: Option<MetaToken>,
    hook: Option<WriteHook<T>>,
}

impl<T> Clone for StateWriter<T> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            meta: self.meta.clone(),
            hook: self.hook.clone(),
        }
    }
}

impl<T: StateValue> StateWriter<T> {
    pub fn new(publisher: Arc<ContainerPublisher<T>>, meta: Option<MetaToken>) -> Self {
        Self {
            publisher,
            meta,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Option<WriteHook<T>>) -> Self {
        self.hook = hook;
        self
    }

    pub fn label(&self) -> &str {
        self.publisher.core().label()
    }

    pub fn value(&self) -> T {
        self.publisher.value()
    }

    /// Apply `message` through the reducer and hook.
    ///
    /// Returns the reducer's follow-up message when the write committed
    /// synchronously.
    pub fn write<M>(
        &self,
        registry: &Registry,
        reducer: &Reducer<T, M>,
        message: M,
    ) -> Option<StoreMessage> {
        let seq = self.publisher.begin_write();
        let current = self.publisher.value();
        let Reduced {
            value,
            message: follow_up,
        } = match reducer(message, &current) {
            Ok(reduced) => reduced,
            Err(err) => {
                self.reject(registry, err);
                return None;
            }
        };

        let outcome = match &self.hook {
            Some(hook) => {
                let mut get = Get::untracked(registry);
                hook(&mut get, value)
            }
            None => HookOutcome::Commit(value),
        };
        self.resolve(registry, seq, outcome, follow_up)
    }

    /// Run a container initializer against a freshly created publisher.
    pub fn initialize(&self, registry: &Registry, initializer: &Initializer<T>) {
        let seq = self.publisher.begin_write();
        let mut get = Get::untracked(registry);
        let outcome = initializer(&mut get);
        if let Some(message) = self.resolve(registry, seq, outcome, None) {
            registry.apply(message, 1);
        }
    }

    /// Settle the outcome of write number `seq`.
    ///
    /// Outcomes of a write that was superseded in the meantime are dropped.
    pub fn resolve(
        &self,
        registry: &Registry,
        seq: u64,
        outcome: HookOutcome<T>,
        follow_up: Option<StoreMessage>,
    ) -> Option<StoreMessage> {
        if !self.publisher.is_latest(seq) {
            debug!(token = %self.label(), seq, "dropping superseded write");
            return None;
        }

        match outcome {
            HookOutcome::Commit(value) => {
                self.commit(registry, value);
                self.set_meta(registry, MetaState::Ok);
                follow_up
            }
            HookOutcome::Reject(err) => {
                self.reject(registry, err);
                None
            }
            HookOutcome::Suspend(Suspended { message, resume }) => {
                self.set_meta(registry, MetaState::pending(message));
                let writer = self.clone();
                registry.enqueue_task(Task::new(self.label(), move |registry| {
                    let mut get = Get::untracked(registry);
                    let outcome = resume(&mut get);
                    writer.resolve(registry, seq, outcome, follow_up)
                }));
                None
            }
        }
    }

    /// Store `value` directly, bypassing reducer and hook, and settle the
    /// meta state. Supersedes any suspended write.
    pub fn supply(&self, registry: &Registry, value: T) {
        self.publisher.begin_write();
        self.commit(registry, value);
        self.set_meta(registry, MetaState::Ok);
    }

    pub fn set_meta(&self, registry: &Registry, state: MetaState) {
        if let Some(meta) = &self.meta {
            registry.set_meta(meta, state);
        }
    }

    pub fn reject(&self, registry: &Registry, err: WriteError) {
        warn!(
            token = %self.label(),
            reason = %err.reason,
            message = %err.message,
            "write rejected"
        );
        self.set_meta(registry, err.into());
    }

    fn commit(&self, registry: &Registry, value: T) {
        self.publisher.replace(value);
        registry.publish_change(self.publisher.as_ref());
    }
}
