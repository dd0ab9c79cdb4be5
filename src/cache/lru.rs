//! Recency Index Module
//!
//! Hash index from key to entry, paired with an intrusive doubly linked list
//! ordering removable entries by last use.

use std::collections::HashMap;

use crate::cache::arena::{EntryArena, EntryId};
use crate::cache::entry::CacheEntry;

// == Recency Index ==
/// Tracks access order for LRU eviction.
///
/// The list runs from head (most recently used) to tail (least recently
/// used). Entries with priority `NotRemovable` stay in the map but are never
/// linked into the list, which makes them immune to eviction.
#[derive(Debug)]
pub(crate) struct RecencyIndex {
    /// Key to entry lookup
    map: HashMap<String, EntryId>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    /// Number of entries linked into the list
    linked: usize,
    high_water_mark: usize,
    low_water_mark: usize,
    /// Set once an insert pushes the list to the high-water mark
    eviction_pending: bool,
}

impl RecencyIndex {
    // == Constructor ==
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            map: HashMap::new(),
            head: None,
            tail: None,
            linked: 0,
            high_water_mark,
            low_water_mark,
            eviction_pending: false,
        }
    }

    // == Get ==
    /// Looks up a key and marks it as recently used.
    pub fn get<V>(&mut self, arena: &mut EntryArena<V>, key: &str) -> Option<EntryId> {
        let id = *self.map.get(key)?;
        self.touch(arena, id);
        Some(id)
    }

    // == Peek ==
    /// Looks up a key without changing its recency.
    pub fn peek(&self, key: &str) -> Option<EntryId> {
        self.map.get(key).copied()
    }

    // == Set ==
    /// Stores `id` under `key` as the most recently used entry.
    ///
    /// Returns the id previously stored under the key, already unlinked; the
    /// caller owns tearing it down.
    pub fn set<V>(&mut self, arena: &mut EntryArena<V>, key: String, id: EntryId) -> Option<EntryId> {
        let replaced = self.map.insert(key, id);
        if let Some(old) = replaced {
            self.unlink(arena, old);
        }
        self.touch(arena, id);

        if self.linked >= self.high_water_mark {
            self.eviction_pending = true;
        }
        replaced
    }

    // == Remove ==
    pub fn remove<V>(&mut self, arena: &mut EntryArena<V>, key: &str) -> Option<EntryId> {
        let id = self.map.remove(key)?;
        self.unlink(arena, id);
        Some(id)
    }

    // == Touch ==
    /// Moves an entry to the head of the list.
    pub fn touch<V>(&mut self, arena: &mut EntryArena<V>, id: EntryId) {
        if !arena[id].is_removable() || self.head == Some(id) {
            return;
        }
        self.unlink(arena, id);
        self.push_front(arena, id);
    }

    /// Whether `id` is already at the head of the list.
    pub fn is_most_recent(&self, id: EntryId) -> bool {
        self.head == Some(id)
    }

    // == Select ==
    /// Ids of every entry matching `predicate`.
    pub fn select_where<V, F>(&self, arena: &EntryArena<V>, mut predicate: F) -> Vec<EntryId>
    where
        F: FnMut(&CacheEntry<V>) -> bool,
    {
        self.map
            .values()
            .copied()
            .filter(|&id| predicate(&arena[id]))
            .collect()
    }

    /// Ids of every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<EntryId> {
        self.map.values().copied().collect()
    }

    /// Ids of the linked entries from most to least recently used.
    #[allow(dead_code)]
    pub fn recency_order<V>(&self, arena: &EntryArena<V>) -> Vec<EntryId> {
        let mut order = Vec::with_capacity(self.linked);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            order.push(id);
            cursor = arena[id].links.next;
        }
        order
    }

    // == Eviction ==
    /// Least recently used removable entry.
    pub fn least_recent(&self) -> Option<EntryId> {
        self.tail
    }

    /// Returns and clears the pending eviction flag.
    pub fn take_eviction_flag(&mut self) -> bool {
        std::mem::take(&mut self.eviction_pending)
    }

    /// Whether eviction has not yet reached the low-water mark.
    pub fn above_low_water_mark(&self) -> bool {
        self.linked > self.low_water_mark
    }

    // == Length ==
    /// Number of keys, removable or not.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Number of entries eligible for eviction.
    #[allow(dead_code)]
    pub fn recency_len(&self) -> usize {
        self.linked
    }

    fn push_front<V>(&mut self, arena: &mut EntryArena<V>, id: EntryId) {
        let old_head = self.head;
        {
            let links = &mut arena[id].links;
            links.prev = None;
            links.next = old_head;
            links.linked = true;
        }
        match old_head {
            Some(head) => arena[head].links.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.linked += 1;
    }

    fn unlink<V>(&mut self, arena: &mut EntryArena<V>, id: EntryId) {
        let links = arena[id].links;
        if !links.linked {
            return;
        }
        match links.prev {
            Some(prev) => arena[prev].links.next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => arena[next].links.prev = links.prev,
            None => self.tail = links.prev,
        }
        arena[id].links = Default::default();
        self.linked -= 1;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::item::CacheItemPriority;
    use chrono::Utc;

    struct Fixture {
        arena: EntryArena<u32>,
        index: RecencyIndex,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: EntryArena::new(),
                index: RecencyIndex::new(100, 50),
            }
        }

        fn with_marks(high: usize, low: usize) -> Self {
            Self {
                arena: EntryArena::new(),
                index: RecencyIndex::new(high, low),
            }
        }

        fn set(&mut self, key: &str) -> EntryId {
            self.set_with_priority(key, CacheItemPriority::Normal)
        }

        fn set_with_priority(&mut self, key: &str, priority: CacheItemPriority) -> EntryId {
            let id = self
                .arena
                .insert(CacheEntry::new(key.to_string(), 0, priority, Utc::now()));
            if let Some(old) = self.index.set(&mut self.arena, key.to_string(), id) {
                self.arena.release(old);
            }
            id
        }

        fn oldest(&self) -> Option<String> {
            self.index
                .least_recent()
                .map(|id| self.arena[id].key.clone())
        }

        fn order(&self) -> Vec<String> {
            self.index
                .recency_order(&self.arena)
                .into_iter()
                .map(|id| self.arena[id].key.clone())
                .collect()
        }
    }

    #[test]
    fn test_lru_new() {
        let fixture = Fixture::new();
        assert_eq!(fixture.index.len(), 0);
        assert_eq!(fixture.index.recency_len(), 0);
        assert!(fixture.index.least_recent().is_none());
    }

    #[test]
    fn test_set_new_keys() {
        let mut fixture = Fixture::new();

        fixture.set("key1");
        fixture.set("key2");
        fixture.set("key3");

        assert_eq!(fixture.index.len(), 3);
        // key1 is oldest (added first)
        assert_eq!(fixture.oldest().as_deref(), Some("key1"));
        assert_eq!(fixture.order(), vec!["key3", "key2", "key1"]);
    }

    #[test]
    fn test_get_moves_to_front() {
        let mut fixture = Fixture::new();

        fixture.set("a");
        fixture.set("b");
        fixture.set("c");

        let id = fixture.index.get(&mut fixture.arena, "a").unwrap();

        assert_eq!(fixture.arena[id].key, "a");
        assert_eq!(fixture.order(), vec!["a", "c", "b"]);
        assert_eq!(fixture.oldest().as_deref(), Some("b"));
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut fixture = Fixture::new();

        fixture.set("a");
        fixture.set("b");

        assert!(fixture.index.peek("a").is_some());
        assert_eq!(fixture.oldest().as_deref(), Some("a"));
    }

    #[test]
    fn test_set_replaces_existing_key() {
        let mut fixture = Fixture::new();

        let first = fixture.set("a");
        fixture.set("b");
        let second = fixture.set("a");

        assert_ne!(first, second);
        assert_eq!(fixture.index.len(), 2);
        assert_eq!(fixture.index.recency_len(), 2);
        assert_eq!(fixture.index.peek("a"), Some(second));
        assert_eq!(fixture.order(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove() {
        let mut fixture = Fixture::new();

        fixture.set("key1");
        fixture.set("key2");
        fixture.set("key3");

        let removed = fixture.index.remove(&mut fixture.arena, "key2");

        assert!(removed.is_some());
        assert_eq!(fixture.index.len(), 2);
        assert_eq!(fixture.order(), vec!["key3", "key1"]);
    }

    #[test]
    fn test_remove_nonexistent_key() {
        let mut fixture = Fixture::new();

        fixture.set("key1");

        // Removing a key that doesn't exist should not affect existing keys
        assert!(fixture.index.remove(&mut fixture.arena, "nonexistent").is_none());
        assert_eq!(fixture.index.len(), 1);
    }

    #[test]
    fn test_remove_head_and_tail() {
        let mut fixture = Fixture::new();

        fixture.set("a");
        fixture.set("b");
        fixture.set("c");

        fixture.index.remove(&mut fixture.arena, "c");
        fixture.index.remove(&mut fixture.arena, "a");

        assert_eq!(fixture.order(), vec!["b"]);
        assert_eq!(fixture.oldest().as_deref(), Some("b"));
    }

    #[test]
    fn test_not_removable_stays_out_of_list() {
        let mut fixture = Fixture::new();

        fixture.set_with_priority("pinned", CacheItemPriority::NotRemovable);
        fixture.set("a");

        assert_eq!(fixture.index.len(), 2);
        assert_eq!(fixture.index.recency_len(), 1);
        assert_eq!(fixture.order(), vec!["a"]);

        // Reading it must not link it either
        fixture.index.get(&mut fixture.arena, "pinned").unwrap();
        assert_eq!(fixture.order(), vec!["a"]);
    }

    #[test]
    fn test_eviction_flag_at_high_water_mark() {
        let mut fixture = Fixture::with_marks(3, 1);

        fixture.set("a");
        fixture.set("b");
        assert!(!fixture.index.take_eviction_flag());

        fixture.set("c");
        assert!(fixture.index.take_eviction_flag());
        // One-shot
        assert!(!fixture.index.take_eviction_flag());
        assert!(fixture.index.above_low_water_mark());
    }

    #[test]
    fn test_not_removable_does_not_count_toward_high_water_mark() {
        let mut fixture = Fixture::with_marks(2, 1);

        fixture.set_with_priority("p1", CacheItemPriority::NotRemovable);
        fixture.set_with_priority("p2", CacheItemPriority::NotRemovable);
        fixture.set("a");

        assert!(!fixture.index.take_eviction_flag());
    }

    #[test]
    fn test_select_where() {
        let mut fixture = Fixture::new();

        fixture.set("apple");
        fixture.set("banana");
        fixture.set("avocado");

        let mut keys: Vec<String> = fixture
            .index
            .select_where(&fixture.arena, |entry| entry.key.starts_with('a'))
            .into_iter()
            .map(|id| fixture.arena[id].key.clone())
            .collect();
        keys.sort();

        assert_eq!(keys, vec!["apple", "avocado"]);
        assert_eq!(fixture.index.snapshot().len(), 3);
    }
}
