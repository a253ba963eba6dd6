//! Read Context
//!
//! Every computation that reads the graph receives a [`Get`]. A tracking
//! `Get` records each publisher it reads, together with that publisher's
//! change stamp, and the recorded set becomes the computation's dependency
//! set for the next cycle. An untracked `Get` (used by hooks, rules and
//! plain registry reads) reads the same values but records nothing.
//!
//! # Implementation
//!
//! The context is an explicit value passed to the computation instead of a
//! thread-local "current computation" pointer, so nested computations each
//! have their own record and nothing has to be pushed or popped.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::StoreError;
use crate::graph::{Dependencies, Dependency, NodeId};
use crate::store::Registry;

use super::publisher::Publisher;
use super::token::Readable;

/// Read access to a registry for the duration of one run.
pub struct Get<'r> {
    registry: &'r Registry,
    reads: Option<IndexMap<NodeId, Dependency>>,
}

impl<'r> Get<'r> {
    /// A context that records dependencies.
    pub(crate) fn tracking(registry: &'r Registry) -> Self {
        Self {
            registry,
            reads: Some(IndexMap::new()),
        }
    }

    /// A context that only reads.
    pub(crate) fn untracked(registry: &'r Registry) -> Self {
        Self {
            registry,
            reads: None,
        }
    }

    /// Read a token.
    ///
    /// # Panics
    ///
    /// Panics if the read is cyclic (a derivation reading itself, directly
    /// or through other derivations). Use [`Get::try_get`] to handle that
    /// case.
    pub fn get<R>(&mut self, token: &R) -> R::Value
    where
        R: Readable + ?Sized,
    {
        match token.read(self) {
            Ok(value) => value,
            Err(err) => panic!("reading {}: {err}", token.describe()),
        }
    }

    /// Read a token, reporting cyclic reads as errors.
    pub fn try_get<R>(&mut self, token: &R) -> Result<R::Value, StoreError>
    where
        R: Readable + ?Sized,
    {
        token.read(self)
    }

    /// Read a token without recording a dependency on it.
    pub fn peek<R>(&mut self, token: &R) -> R::Value
    where
        R: Readable + ?Sized,
    {
        let saved = self.reads.take();
        let value = self.get(token);
        self.reads = saved;
        value
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn is_tracking(&self) -> bool {
        self.reads.is_some()
    }

    /// Record a read of `publisher`. The first read of a run fixes the stamp.
    pub(crate) fn track(&mut self, publisher: &Arc<dyn Publisher>) {
        if let Some(reads) = self.reads.as_mut() {
            reads
                .entry(publisher.core().id())
                .or_insert_with(|| Dependency::new(Arc::clone(publisher)));
        }
    }

    /// Number of distinct publishers read so far.
    pub fn dependency_count(&self) -> usize {
        self.reads.as_ref().map_or(0, IndexMap::len)
    }

    /// The recorded dependency set, in first-read order.
    pub(crate) fn into_dependencies(self) -> Dependencies {
        self.reads
            .map(|reads| reads.into_values().collect())
            .unwrap_or_default()
    }
}
