//! Subscriber arena.
//!
//! A subscriber is any computation that depends on reactive values: a
//! derivation or a user effect. Subscribers live in an arena and are named
//! by a [`SubscriberId`] (slot index + generation). Listener lists never
//! hold subscribers directly; they hold ids plus the subscriber version seen
//! at registration time. An entry is live only while both the generation and
//! the version still match, so removing a subscriber or re-running it
//! invalidates all of its old registrations at once without touching the
//! lists themselves.

use std::sync::{Arc, Weak};

use crate::reactive::{EffectNode, Publisher};

/// Handle to a subscriber slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId {
    index: u32,
    generation: u32,
}

impl SubscriberId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// What a subscriber slot refers to.
///
/// Derivations are owned by the registry's publisher map, so the arena only
/// keeps a weak reference. Effects are owned by the arena.
pub(crate) enum Listener {
    Derivation(Weak<dyn Publisher>),
    Effect(Arc<EffectNode>),
}

/// A listener that was live when its list was walked.
pub(crate) enum Notified {
    Derivation(Arc<dyn Publisher>),
    Effect(SubscriberId, Arc<EffectNode>),
}

struct Slot {
    generation: u32,
    version: u64,
    listener: Option<Listener>,
}

/// Storage for every subscriber of one registry.
#[derive(Default)]
pub(crate) struct SubscriberArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SubscriberArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a listener and hand out its id.
    pub fn insert(&mut self, listener: Listener) -> SubscriberId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.listener = Some(listener);
            slot.version = 0;
            return SubscriberId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            version: 0,
            listener: Some(listener),
        });
        SubscriberId {
            index,
            generation: 0,
        }
    }

    /// Remove a subscriber. Its slot generation moves on, so every listener
    /// entry that still names it becomes stale.
    ///
    /// The listener is handed back so the caller can drop it after releasing
    /// the arena lock.
    pub fn remove(&mut self, id: SubscriberId) -> Option<Listener> {
        let slot = self.slot_mut(id)?;
        let listener = slot.listener.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        listener
    }

    /// Start a new run for a subscriber. Registrations made with an older
    /// version are stale from now on.
    pub fn bump_version(&mut self, id: SubscriberId) -> Option<u64> {
        let slot = self.slot_mut(id)?;
        slot.version += 1;
        Some(slot.version)
    }

    /// Whether the id still names a live subscriber.
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.slot(id).is_some()
    }

    /// Resolve a listener entry, or `None` when it is stale.
    pub fn resolve(&self, id: SubscriberId, version: u64) -> Option<Notified> {
        let slot = self.slot(id)?;
        if slot.version != version {
            return None;
        }
        match slot.listener.as_ref()? {
            Listener::Derivation(weak) => weak.upgrade().map(Notified::Derivation),
            Listener::Effect(effect) => Some(Notified::Effect(id, Arc::clone(effect))),
        }
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn slot(&self, id: SubscriberId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.listener.is_some())
    }

    fn slot_mut(&mut self, id: SubscriberId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.listener.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Effect;

    fn effect_listener() -> Listener {
        Listener::Effect(Arc::new(EffectNode::new(Effect::new(|_| {}))))
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let mut arena = SubscriberArena::new();
        let id1 = arena.insert(effect_listener());
        let id2 = arena.insert(effect_listener());
        let id3 = arena.insert(effect_listener());

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn removed_slot_is_reused_with_new_generation() {
        let mut arena = SubscriberArena::new();
        let first = arena.insert(effect_listener());
        assert!(arena.remove(first).is_some());
        assert!(!arena.contains(first));

        let second = arena.insert(effect_listener());
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(arena.contains(second));
        assert!(!arena.contains(first));
    }

    #[test]
    fn version_bump_makes_old_entries_stale() {
        let mut arena = SubscriberArena::new();
        let id = arena.insert(effect_listener());

        let v1 = arena.bump_version(id).unwrap();
        assert!(arena.resolve(id, v1).is_some());

        let v2 = arena.bump_version(id).unwrap();
        assert!(arena.resolve(id, v1).is_none());
        assert!(arena.resolve(id, v2).is_some());
    }

    #[test]
    fn removed_subscriber_cannot_be_bumped() {
        let mut arena = SubscriberArena::new();
        let id = arena.insert(effect_listener());
        arena.remove(id);

        assert!(arena.bump_version(id).is_none());
        assert!(arena.remove(id).is_none());
        assert!(arena.is_empty());
    }
}
