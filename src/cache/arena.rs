//! Entry Arena Module
//!
//! Owns every entry record. The recency index, the recency list and the expiry
//! heap refer to entries by generational id, so one logical entry lives in
//! exactly one place.

use std::ops::{Index, IndexMut};

use crate::cache::entry::CacheEntry;

// == Entry Id ==
/// Handle to an arena slot. A released slot bumps its generation, so ids of
/// removed entries never resolve to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId {
    index: usize,
    generation: u64,
}

struct Slot<V> {
    generation: u64,
    entry: Option<CacheEntry<V>>,
}

// == Entry Arena ==
pub(crate) struct EntryArena<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    occupied: usize,
}

impl<V> EntryArena<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            occupied: 0,
        }
    }

    /// Stores an entry and returns its id.
    pub fn insert(&mut self, entry: CacheEntry<V>) -> EntryId {
        self.occupied += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = Some(entry);
                EntryId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                EntryId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&CacheEntry<V>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry<V>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Frees the slot and returns what it held.
    pub fn release(&mut self, id: EntryId) -> Option<CacheEntry<V>> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)?;
        let entry = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(id.index);
        self.occupied -= 1;
        Some(entry)
    }

    /// Whether `id` still names a live (not tombstoned) entry.
    pub fn is_live(&self, id: EntryId) -> bool {
        self.get(id).is_some_and(|entry| !entry.disabled)
    }

    /// Occupied slots, tombstones included.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.occupied
    }
}

impl<V> Index<EntryId> for EntryArena<V> {
    type Output = CacheEntry<V>;

    fn index(&self, id: EntryId) -> &Self::Output {
        match self.get(id) {
            Some(entry) => entry,
            None => panic!("stale entry id {id:?}"),
        }
    }
}

impl<V> IndexMut<EntryId> for EntryArena<V> {
    fn index_mut(&mut self, id: EntryId) -> &mut Self::Output {
        match self.get_mut(id) {
            Some(entry) => entry,
            None => panic!("stale entry id {id:?}"),
        }
    }
}
