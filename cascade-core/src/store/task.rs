//! Queued continuations.
//!
//! A hook, initializer or command that cannot finish synchronously leaves a
//! [`Task`] behind. Tasks wait in the registry's queue until
//! [`Registry::run_tasks`](super::Registry::run_tasks) resumes them, each in
//! its own dispatch cycle.

use std::fmt;

use super::message::StoreMessage;
use super::registry::Registry;

type Resume = Box<dyn FnOnce(&Registry) -> Option<StoreMessage> + Send>;

pub(crate) struct Task {
    origin: String,
    resume: Resume,
}

impl Task {
    pub fn new<F>(origin: &str, resume: F) -> Self
    where
        F: FnOnce(&Registry) -> Option<StoreMessage> + Send + 'static,
    {
        Self {
            origin: origin.to_string(),
            resume: Box::new(resume),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Resume the continuation. The returned message is a follow-up to apply
    /// in the same cycle.
    pub fn run(self, registry: &Registry) -> Option<StoreMessage> {
        (self.resume)(registry)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("origin", &self.origin).finish()
    }
}
