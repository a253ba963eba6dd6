//! Dispatch engine.
//!
//! Interprets [`StoreMessage`]s against a registry. A dispatch is one
//! transaction: every write in it commits and notifies in declaration order,
//! and effects run only after the whole message, follow-ups included, has
//! been applied.
//!
//! Failures local to one write (a rejecting reducer or hook) are contained
//! in that token's meta state; the rest of a batch still applies.

use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::reactive::{Container, StateValue};

use super::message::{Invocation, StoreMessage, Write};
use super::registry::Registry;

impl Registry {
    /// Apply `message` and settle before returning.
    ///
    /// On a disposed registry this logs and does nothing.
    pub fn dispatch(&self, message: StoreMessage) {
        if self.is_disposed() {
            warn!(registry = %self.name(), ?message, "dispatch on a disposed registry ignored");
            return;
        }
        debug!(registry = %self.name(), ?message, "dispatch");
        self.transaction(|| self.apply(message, 0));
    }

    /// Shorthand for dispatching [`Container::write`].
    pub fn write<T, M>(&self, container: &Container<T, M>, message: M)
    where
        T: StateValue,
        M: Send + 'static,
    {
        self.dispatch(container.write(message));
    }

    /// Apply `message` inside the current transaction. `depth` counts the
    /// follow-up messages chained before it.
    pub(crate) fn apply(&self, message: StoreMessage, depth: usize) {
        match message {
            StoreMessage::Write(Write { target, op }) => {
                trace!(target = %target, depth, "write");
                let follow_up = op(self);
                self.cascade(&target, follow_up, depth);
            }
            StoreMessage::Batch(messages) => {
                for message in messages {
                    self.apply(message, depth);
                }
            }
            StoreMessage::Run(run) => run(self),
            StoreMessage::Exec(Invocation { origin, op }) => {
                trace!(origin = %origin, depth, "exec");
                let follow_up = op(self);
                self.cascade(&origin, follow_up, depth);
            }
        }
    }

    /// Apply a follow-up message one level deeper, within the configured
    /// bound.
    pub(crate) fn cascade(&self, origin: &str, follow_up: Option<StoreMessage>, depth: usize) {
        let Some(message) = follow_up else {
            return;
        };

        let limit = self.config().max_cascade_depth;
        if depth >= limit {
            let err = StoreError::CascadeTooDeep {
                token: origin.to_string(),
                limit,
            };
            warn!(registry = %self.name(), error = %err, ?message, "follow-up dropped");
            return;
        }
        self.apply(message, depth + 1);
    }
}
