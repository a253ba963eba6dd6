//! Listener lists.
//!
//! Each publisher keeps an ordered list of `(subscriber, version)` entries.
//! Derivations are pushed at the head and effects at the tail, so a walk
//! reaches every derivation (and, recursively, whatever it feeds) before
//! the leaf effects registered directly on this publisher.
//!
//! A subscriber holds at most one entry per list: registering again only
//! moves the recorded version forward. Entries left stale by removed
//! subscribers are dropped the next time the list is walked.

use std::collections::VecDeque;

use super::subscriber::{Notified, SubscriberArena, SubscriberId};

/// One registration of a subscriber on a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerEntry {
    pub subscriber: SubscriberId,
    pub version: u64,
}

/// Ordered subscriber set of a single publisher.
#[derive(Debug, Default)]
pub struct ListenerList {
    entries: VecDeque<ListenerEntry>,
}

impl ListenerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a derivation (visited first).
    pub fn push_derivation(&mut self, entry: ListenerEntry) {
        if !self.refresh(entry) {
            self.entries.push_front(entry);
        }
    }

    /// Register a user effect (visited last).
    pub fn push_effect(&mut self, entry: ListenerEntry) {
        if !self.refresh(entry) {
            self.entries.push_back(entry);
        }
    }

    /// Update the version of an existing entry for the same subscriber.
    fn refresh(&mut self, entry: ListenerEntry) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.subscriber == entry.subscriber)
        {
            Some(existing) => {
                existing.version = existing.version.max(entry.version);
                true
            }
            None => false,
        }
    }

    /// Prune stale entries and return the live listeners in walk order.
    pub(crate) fn collect_live(&mut self, arena: &SubscriberArena) -> Vec<Notified> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|entry| match arena.resolve(entry.subscriber, entry.version) {
            Some(listener) => {
                live.push(listener);
                true
            }
            None => false,
        });
        live
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
