//! Variables.
//!
//! A variable is a re-assignable reference: it points either at another
//! readable token or at a plain value. Reading through a variable resolves
//! the current target on every run and depends on the target only, so
//! assigning a new target is prospective. Computations keep listening to
//! the old target until they next run.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::error::StoreError;
use crate::graph::NodeKind;
use crate::store::{Registry, StoreMessage};

use super::context::Get;
use super::publisher::{downcast, downcast_arc, Publisher, PublisherCore};
use super::token::{Readable, StateToken, StateValue, TokenKind, TokenLabel};

/// What a variable points at.
pub enum VariableTarget<T> {
    Token(Arc<dyn Readable<Value = T>>),
    Value(T),
}

impl<T: StateValue> VariableTarget<T> {
    pub fn token<R>(token: R) -> Self
    where
        R: Readable<Value = T>,
    {
        VariableTarget::Token(Arc::new(token))
    }

    pub fn value(value: T) -> Self {
        VariableTarget::Value(value)
    }

    /// Whether two targets are known to be the same. Token targets always
    /// count as different.
    fn same_as(&self, other: &Self) -> bool {
        matches!((self, other), (VariableTarget::Value(a), VariableTarget::Value(b)) if a == b)
    }
}

impl<T: Clone> Clone for VariableTarget<T> {
    fn clone(&self) -> Self {
        match self {
            VariableTarget::Token(token) => VariableTarget::Token(Arc::clone(token)),
            VariableTarget::Value(value) => VariableTarget::Value(value.clone()),
        }
    }
}

impl<T: StateValue> fmt::Debug for VariableTarget<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableTarget::Token(token) => {
                f.debug_tuple("Token").field(&token.describe()).finish()
            }
            VariableTarget::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// Re-assignable reference to a token or a plain value.
pub struct Variable<T> {
    label: TokenLabel,
    initial: VariableTarget<T>,
}

impl<T: StateValue> Variable<T> {
    pub fn new(target: VariableTarget<T>) -> Self {
        Self {
            label: TokenLabel::new(TokenKind::Variable),
            initial: target,
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

    /// A message pointing the variable at `target`.
    pub fn assign(&self, target: VariableTarget<T>) -> StoreMessage {
        let token = self.clone();
        StoreMessage::from_write(self.label.to_string(), move |registry| {
            let publisher = registry.publisher(&token);
            let publisher = match downcast_arc::<VariablePublisher<T>>(publisher) {
                Ok(publisher) => publisher,
                Err(err) => {
                    warn!(token = %token.label, error = %err, "assign skipped");
                    return None;
                }
            };
            if publisher.replace(target) {
                registry.publish_change(publisher.as_ref());
            } else {
                trace!(token = %token.label, "assigned an equal value");
            }
            None
        })
    }

    fn target(
        &self,
        registry: &Registry,
    ) -> Result<(Arc<dyn Publisher>, VariableTarget<T>), StoreError> {
        let publisher = registry.publisher(self);
        let target = downcast::<VariablePublisher<T>>(&*publisher)?.target();
        Ok((publisher, target))
    }
}

impl<T: Clone> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            initial: self.initial.clone(),
        }
    }
}

impl<T> PartialEq for Variable<T> {
    fn eq(&self, other: &Self) -> bool {
        self.label.id() == other.label.id()
    }
}

impl<T> Eq for Variable<T> {}

impl<T> fmt::Display for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label.fmt(f)
    }
}

impl<T> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Variable").field(&self.label.to_string()).finish()
    }
}

impl<T: StateValue> StateToken for Variable<T> {
    fn label(&self) -> &TokenLabel {
        &self.label
    }

    fn create_publisher(&self, _registry: &Registry) -> Arc<dyn Publisher> {
        Arc::new(VariablePublisher {
            core: PublisherCore::for_token(NodeKind::Source, &self.label),
            target: RwLock::new(self.initial.clone()),
        })
    }
}

impl<T: StateValue> Readable for Variable<T> {
    type Value = T;

    fn read(&self, get: &mut Get<'_>) -> Result<T, StoreError> {
        let (publisher, target) = self.target(get.registry())?;
        match target {
            VariableTarget::Token(token) => token.read(get),
            VariableTarget::Value(value) => {
                get.track(&publisher);
                Ok(value)
            }
        }
    }

    /// Binds to the current target; the variable itself only while it
    /// holds a plain value.
    fn bind(&self, registry: &Registry) -> Arc<dyn Readable<Value = T>> {
        match self.target(registry) {
            Ok((_, VariableTarget::Token(token))) => token.bind(registry),
            _ => Arc::new(self.clone()),
        }
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

/// Publisher of a variable.
pub struct VariablePublisher<T> {
    core: PublisherCore,
    target: RwLock<VariableTarget<T>>,
}

impl<T: StateValue> VariablePublisher<T> {
    pub fn target(&self) -> VariableTarget<T> {
        self.target.read().clone()
    }

    /// Point at `target`. Returns `false` if it equals the current target.
    pub(crate) fn replace(&self, target: VariableTarget<T>) -> bool {
        let mut current = self.target.write();
        if current.same_as(&target) {
            return false;
        }
        *current = target;
        true
    }
}

impl<T: StateValue> Publisher for VariablePublisher<T> {
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
