//! Expiry Heap Module
//!
//! Array-backed binary min-heap of entry deadlines. Every entry in the heap
//! carries a back-pointer to its slot so its deadline can be changed without
//! a linear search.

use chrono::{DateTime, Utc};

use crate::cache::arena::{EntryArena, EntryId};

/// Capacity reserved on the first enqueue.
const INITIAL_CAPACITY: usize = 64;

/// Capacity above which a half-empty heap gives memory back.
const COMPACT_THRESHOLD: usize = 4096;

// == Heap Slots ==
/// Storage for the heap's back-pointers.
pub(crate) trait HeapSlots {
    fn heap_index(&self, id: EntryId) -> Option<usize>;
    fn set_heap_index(&mut self, id: EntryId, index: Option<usize>);
}

impl<V> HeapSlots for EntryArena<V> {
    fn heap_index(&self, id: EntryId) -> Option<usize> {
        self.get(id).and_then(|entry| entry.heap_index)
    }

    fn set_heap_index(&mut self, id: EntryId, index: Option<usize>) {
        if let Some(entry) = self.get_mut(id) {
            entry.heap_index = index;
        }
    }
}

// == Heap Node ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeapNode {
    pub expires_at: DateTime<Utc>,
    pub id: EntryId,
}

// == Expiry Heap ==
#[derive(Debug, Default)]
pub(crate) struct ExpiryHeap {
    nodes: Vec<HeapNode>,
}

impl ExpiryHeap {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    // == Enqueue ==
    pub fn enqueue<S: HeapSlots>(&mut self, slots: &mut S, id: EntryId, expires_at: DateTime<Utc>) {
        self.grow_if_full();
        self.nodes.push(HeapNode { expires_at, id });
        let index = self.nodes.len() - 1;
        slots.set_heap_index(id, Some(index));
        self.sift_up(slots, index);
    }

    // == Dequeue ==
    /// Removes and returns the earliest deadline.
    pub fn dequeue<S: HeapSlots>(&mut self, slots: &mut S) -> Option<HeapNode> {
        if self.nodes.is_empty() {
            return None;
        }
        let node = self.take_at(slots, 0);
        self.compact();
        Some(node)
    }

    // == Peek ==
    pub fn peek(&self) -> Option<HeapNode> {
        self.nodes.first().copied()
    }

    // == Update ==
    /// Moves an entry already in the heap to match its new deadline.
    ///
    /// Returns false if the entry is not in the heap.
    pub fn update<S: HeapSlots>(&mut self, slots: &mut S, id: EntryId, expires_at: DateTime<Utc>) -> bool {
        let Some(index) = self.position(slots, id) else {
            return false;
        };
        self.nodes[index].expires_at = expires_at;
        if self.sift_up(slots, index) == index {
            self.sift_down(slots, index);
        }
        true
    }

    // == Remove ==
    /// Drops an entry from the heap wherever it sits.
    pub fn remove<S: HeapSlots>(&mut self, slots: &mut S, id: EntryId) -> bool {
        let Some(index) = self.position(slots, id) else {
            return false;
        };
        self.take_at(slots, index);
        self.compact();
        true
    }

    // == Length ==
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[allow(dead_code)]
    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    fn position<S: HeapSlots>(&self, slots: &S, id: EntryId) -> Option<usize> {
        slots
            .heap_index(id)
            .filter(|&index| self.nodes.get(index).is_some_and(|node| node.id == id))
    }

    fn take_at<S: HeapSlots>(&mut self, slots: &mut S, index: usize) -> HeapNode {
        let last = self.nodes.len() - 1;
        self.swap(slots, index, last);
        let node = match self.nodes.pop() {
            Some(node) => node,
            None => unreachable!("heap cannot be empty here"),
        };
        slots.set_heap_index(node.id, None);

        if index < self.nodes.len() && self.sift_up(slots, index) == index {
            self.sift_down(slots, index);
        }
        node
    }

    fn sift_up<S: HeapSlots>(&mut self, slots: &mut S, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.nodes[parent].expires_at <= self.nodes[index].expires_at {
                break;
            }
            self.swap(slots, parent, index);
            index = parent;
        }
        index
    }

    fn sift_down<S: HeapSlots>(&mut self, slots: &mut S, mut index: usize) -> usize {
        let len = self.nodes.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.nodes[right].expires_at < self.nodes[left].expires_at {
                right
            } else {
                left
            };
            if self.nodes[index].expires_at <= self.nodes[child].expires_at {
                break;
            }
            self.swap(slots, index, child);
            index = child;
        }
        index
    }

    fn swap<S: HeapSlots>(&mut self, slots: &mut S, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.nodes.swap(a, b);
        slots.set_heap_index(self.nodes[a].id, Some(a));
        slots.set_heap_index(self.nodes[b].id, Some(b));
    }

    fn grow_if_full(&mut self) {
        let capacity = self.nodes.capacity();
        if self.nodes.len() == capacity {
            self.nodes.reserve_exact(capacity.max(INITIAL_CAPACITY));
        }
    }

    fn compact(&mut self) {
        let capacity = self.nodes.capacity();
        if capacity > COMPACT_THRESHOLD && self.nodes.len() < capacity / 2 {
            self.nodes.shrink_to(capacity / 2);
        }
    }
}
