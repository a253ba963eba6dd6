//! Dependency Graph
//!
//! This module holds the bookkeeping that connects publishers to the
//! computations reading them.
//!
//! # Overview
//!
//! - Publishers own a [`ListenerList`] of `(subscriber, version)` entries.
//! - Subscribers (derivations and effects) live in an arena and are named
//!   by a [`SubscriberId`].
//! - Derivations and effects keep a [`NodeState`]: their dirty state plus
//!   the dependencies read on their last run, each stamped with the
//!   publisher's change stamp at read time.
//!
//! # Design Decisions
//!
//! 1. Edges are stored on the publisher side only (as listener entries) and
//!    on the subscriber side only as the last run's dependency list. A re-run
//!    bumps the subscriber version instead of unlinking old edges, and walks
//!    prune whatever went stale.
//!
//! 2. Change detection uses a registry-wide monotonic stamp. A dependency
//!    changed if its publisher's stamp moved past the one recorded at read
//!    time, which makes "did any input change?" a cheap comparison.

mod listeners;
mod node;
mod scheduler;
mod subscriber;

pub use listeners::{ListenerEntry, ListenerList};
pub use node::{Dependencies, Dependency, DirtyState, NodeId, NodeKind, NodeState};
pub use subscriber::SubscriberId;

pub(crate) use scheduler::UpdateScheduler;
pub(crate) use subscriber::{Listener, Notified, SubscriberArena};
