//! Store layer: the registry, the messages that change it and the dispatch
//! engine that applies them.

mod command;
mod dispatch;
mod message;
mod registry;
mod snapshot;
mod task;

pub use command::{Command, CommandActions, Rule, Selection};
pub use message::{Invocation, StoreMessage, Write};
pub use registry::Registry;
pub use snapshot::{Snapshot, StateSnapshot, TokenManifest};

pub(crate) use registry::RegistryInner;
pub(crate) use task::Task;
