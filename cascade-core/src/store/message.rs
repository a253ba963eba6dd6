//! Store messages.
//!
//! Everything that changes a registry is expressed as a [`StoreMessage`] and
//! handed to [`Registry::dispatch`](super::Registry::dispatch). Messages are
//! plain values: building one does nothing until it is dispatched.

use std::fmt;

use crate::reactive::{Container, StateValue};

use super::command::Command;
use super::registry::Registry;

/// Deferred operation producing an optional follow-up message.
pub(crate) type Op = Box<dyn FnOnce(&Registry) -> Option<StoreMessage> + Send>;

/// A write against one token.
pub struct Write {
    pub(crate) target: String,
    pub(crate) op: Op,
}

impl Write {
    /// Debug form of the written token.
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// A rule, selection or command bound to its arguments.
pub struct Invocation {
    pub(crate) origin: String,
    pub(crate) op: Op,
}

impl Invocation {
    pub(crate) fn new<F>(origin: String, op: F) -> Self
    where
        F: FnOnce(&Registry) -> Option<StoreMessage> + Send + 'static,
    {
        Self {
            origin,
            op: Box::new(op),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Something to apply to a registry.
pub enum StoreMessage {
    /// Write to a single token.
    Write(Write),
    /// Apply several messages in order, as one transaction.
    Batch(Vec<StoreMessage>),
    /// Run arbitrary code against the registry.
    Run(Box<dyn FnOnce(&Registry) + Send>),
    /// Invoke a rule, selection or command.
    Exec(Invocation),
}

impl StoreMessage {
    pub(crate) fn from_write<F>(target: String, op: F) -> Self
    where
        F: FnOnce(&Registry) -> Option<StoreMessage> + Send + 'static,
    {
        StoreMessage::Write(Write {
            target,
            op: Box::new(op),
        })
    }

    /// Same as [`Container::write`].
    pub fn write<T, M>(container: &Container<T, M>, message: M) -> Self
    where
        T: StateValue,
        M: Send + 'static,
    {
        container.write(message)
    }

    pub fn batch(messages: impl IntoIterator<Item = StoreMessage>) -> Self {
        StoreMessage::Batch(messages.into_iter().collect())
    }

    /// A message that does nothing.
    pub fn empty() -> Self {
        StoreMessage::Batch(Vec::new())
    }

    pub fn run<F>(f: F) -> Self
    where
        F: FnOnce(&Registry) + Send + 'static,
    {
        StoreMessage::Run(Box::new(f))
    }

    /// Invoke `command` with `payload`.
    pub fn exec<P: Send + 'static>(command: &Command<P>, payload: P) -> Self {
        command.invoke(payload)
    }

    /// Number of leaf messages, counting batch members recursively.
    pub fn len(&self) -> usize {
        match self {
            StoreMessage::Batch(messages) => messages.iter().map(StoreMessage::len).sum(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for StoreMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMessage::Write(write) => f.debug_tuple("Write").field(&write.target).finish(),
            StoreMessage::Batch(messages) => f.debug_list().entries(messages).finish(),
            StoreMessage::Run(_) => f.write_str("Run"),
            StoreMessage::Exec(invocation) => {
                f.debug_tuple("Exec").field(&invocation.origin).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_leaves() {
        let a = Container::new(0).named("a");
        let message = StoreMessage::batch([
            a.write(1),
            StoreMessage::batch([a.write(2), StoreMessage::run(|_| {})]),
            StoreMessage::empty(),
        ]);
        assert_eq!(message.len(), 3);
        assert!(StoreMessage::empty().is_empty());
    }

    #[test]
    fn debug_names_targets() {
        let a = Container::new(0).named("a").with_key("k");
        let message = StoreMessage::batch([StoreMessage::write(&a, 1), StoreMessage::run(|_| {})]);
        assert_eq!(format!("{message:?}"), r#"[Write("a-k"), Run]"#);
    }
}
