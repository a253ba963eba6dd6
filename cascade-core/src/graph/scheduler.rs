//! Update Scheduler
//!
//! The scheduler holds the bookkeeping for one dispatch cycle. It does not
//! walk the graph itself (the registry does that); it decides *when* the
//! collected effects may run.
//!
//! # Algorithm
//!
//! Propagation is split in two phases:
//!
//! 1. Notify: a write walks the written publisher's listener list. Every
//!    derivation reached is marked "maybe dirty" and its own listeners are
//!    walked in turn. Effects are only collected here, in walk order.
//! 2. Run: when the outermost transaction ends, the pending effects are
//!    taken out in one swap. For each one the registry pulls its
//!    dependencies up to date (each derivation recomputes at most once) and
//!    runs the effect only if one of them really changed.
//!
//! Writes made by effects during the run phase land in a fresh pending set
//! and are handled in the next round, so an effect never sees a half-settled
//! batch and nothing registered mid-round is visited by that round.

use std::sync::Arc;

use indexmap::IndexMap;

use super::subscriber::SubscriberId;
use crate::reactive::EffectNode;

/// Effects waiting for the run phase, deduplicated, in notify order.
pub(crate) type PendingEffects = IndexMap<SubscriberId, Arc<EffectNode>>;

/// Transaction depth and pending effects of a registry.
#[derive(Default)]
pub(crate) struct UpdateScheduler {
    depth: usize,
    settling: bool,
    pending: PendingEffects,
}

impl UpdateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a (possibly nested) transaction.
    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// Leave a transaction.
    ///
    /// Returns `true` when the caller closed the outermost transaction and
    /// must now run the settle loop. The scheduler is then marked as
    /// settling, so transactions opened by effects do not settle on their
    /// own.
    pub fn end(&mut self) -> bool {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 && !self.settling {
            self.settling = true;
            true
        } else {
            false
        }
    }

    /// Mark the settle loop as finished.
    pub fn finish_settle(&mut self) {
        self.settling = false;
    }

    /// Queue an effect for the run phase. Queuing twice is a no-op.
    pub fn enqueue(&mut self, id: SubscriberId, effect: Arc<EffectNode>) {
        self.pending.entry(id).or_insert(effect);
    }

    /// Swap out the pending set for this round.
    pub fn take_pending(&mut self) -> PendingEffects {
        std::mem::take(&mut self.pending)
    }

    /// Drop everything still queued.
    pub fn discard_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[cfg(test)]
    pub fn is_settling(&self) -> bool {
        self.settling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::subscriber::{Listener, SubscriberArena};
    use crate::reactive::Effect;

    fn effect(arena: &mut SubscriberArena) -> (SubscriberId, Arc<EffectNode>) {
        let node = Arc::new(EffectNode::new(Effect::new(|_| {})));
        let id = arena.insert(Listener::Effect(Arc::clone(&node)));
        (id, node)
    }

    #[test]
    fn only_outermost_end_settles() {
        let mut scheduler = UpdateScheduler::new();
        scheduler.begin();
        scheduler.begin();
        assert_eq!(scheduler.depth(), 2);

        assert!(!scheduler.end());
        assert!(scheduler.end());
        assert!(scheduler.is_settling());

        // A transaction opened while settling does not settle again
        scheduler.begin();
        assert!(!scheduler.end());

        scheduler.finish_settle();
        scheduler.begin();
        assert!(scheduler.end());
    }

    #[test]
    fn enqueue_deduplicates_and_keeps_order() {
        let mut arena = SubscriberArena::new();
        let (a, a_node) = effect(&mut arena);
        let (b, b_node) = effect(&mut arena);

        let mut scheduler = UpdateScheduler::new();
        scheduler.enqueue(b, Arc::clone(&b_node));
        scheduler.enqueue(a, Arc::clone(&a_node));
        scheduler.enqueue(b, b_node);
        assert_eq!(scheduler.pending_count(), 2);

        let pending = scheduler.take_pending();
        let order: Vec<_> = pending.keys().copied().collect();
        assert_eq!(order, vec![b, a]);

        // The set was swapped out, not copied
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn discard_pending_reports_count() {
        let mut arena = SubscriberArena::new();
        let (a, a_node) = effect(&mut arena);

        let mut scheduler = UpdateScheduler::new();
        scheduler.enqueue(a, a_node);
        assert_eq!(scheduler.discard_pending(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
