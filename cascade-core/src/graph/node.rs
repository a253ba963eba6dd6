//! Graph Nodes
//!
//! This module defines the per-node bookkeeping shared by publishers,
//! derivations and effects: identity, kind, dirty state and the dependency
//! set recorded on the last run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::reactive::Publisher;

/// Unique identifier for a node in the dependency graph.
///
/// Every publisher gets one, including collection slots which have no token
/// of their own. Dependency sets are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Written from outside (containers, meta states, variables, slots).
    /// These have dependents but no dependencies.
    Source,

    /// A derived value. Has dependencies and may have dependents.
    Derived,

    /// A user effect. Has dependencies but no dependents.
    Effect,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// Something upstream was written. Whether this node's own inputs
    /// actually changed is checked when the node is next pulled.
    MaybeDirty,

    /// The node has never run, or must recompute regardless of its inputs.
    Dirty,
}

/// A publisher read during a run, together with the change stamp it had at
/// the time of the read.
#[derive(Clone)]
pub struct Dependency {
    pub publisher: Arc<dyn Publisher>,
    pub seen: u64,
}

impl Dependency {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        let seen = publisher.core().changed_at();
        Self { publisher, seen }
    }

    /// Whether the publisher changed after it was read.
    pub fn has_changed(&self) -> bool {
        self.publisher.core().changed_at() > self.seen
    }
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("publisher", &self.publisher.core().label())
            .field("seen", &self.seen)
            .finish()
    }
}

/// Dependencies recorded by one run. Most runs read a handful of tokens.
pub type Dependencies = SmallVec<[Dependency; 4]>;

/// Dirty state plus dependency set of a derivation or effect.
#[derive(Debug)]
pub struct NodeState {
    kind: NodeKind,
    dirty: DirtyState,
    dependencies: Dependencies,
}

impl NodeState {
    /// Create the state for a node of the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            dirty: match kind {
                NodeKind::Source => DirtyState::Clean,
                // Start dirty to ensure the first computation
                NodeKind::Derived => DirtyState::Dirty,
                NodeKind::Effect => DirtyState::Dirty,
            },
            dependencies: Dependencies::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    pub fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    /// Mark the node as maybe dirty.
    ///
    /// Returns `true` only on the `Clean -> MaybeDirty` transition, which is
    /// when the caller has to keep walking downstream.
    pub fn mark_maybe_dirty(&mut self) -> bool {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
            true
        } else {
            false
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    /// Replace the dependency set with the one recorded by the latest run.
    pub fn set_dependencies(&mut self, dependencies: Dependencies) {
        self.dependencies = dependencies;
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
}
