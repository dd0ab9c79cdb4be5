//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the heap, recency and store invariants over
//! arbitrary operation sequences.

use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;

use crate::cache::arena::{EntryArena, EntryId};
use crate::cache::entry::CacheEntry;
use crate::cache::heap::{ExpiryHeap, HeapSlots};
use crate::cache::{CacheItemOptions, CacheItemPriority, CacheStore};
use crate::clock::ManualClock;
use crate::config::CacheConfig;

// == Test Configuration ==
const TEST_HIGH_WATER_MARK: usize = 20;
const TEST_LOW_WATER_MARK: usize = 10;

// == Strategies ==
/// Generates valid cache keys (non-empty)
fn valid_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,16}".prop_map(|s| s)
}

fn valid_value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{1,64}".prop_map(|s| s)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Insert { key: String, value: String },
    InsertPinned { key: String, value: String },
    Add { key: String, value: String },
    Get { key: String },
    Remove { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (valid_key_strategy(), valid_value_strategy())
            .prop_map(|(key, value)| CacheOp::Insert { key, value }),
        1 => (valid_key_strategy(), valid_value_strategy())
            .prop_map(|(key, value)| CacheOp::InsertPinned { key, value }),
        1 => (valid_key_strategy(), valid_value_strategy())
            .prop_map(|(key, value)| CacheOp::Add { key, value }),
        2 => valid_key_strategy().prop_map(|key| CacheOp::Get { key }),
        1 => valid_key_strategy().prop_map(|key| CacheOp::Remove { key }),
    ]
}

#[derive(Debug, Clone)]
enum HeapOp {
    Enqueue(i64),
    Update(usize, i64),
    Remove(usize),
    Dequeue,
}

fn heap_op_strategy() -> impl Strategy<Value = HeapOp> {
    prop_oneof![
        3 => (0i64..10_000).prop_map(HeapOp::Enqueue),
        2 => (any::<usize>(), 0i64..10_000).prop_map(|(at, offset)| HeapOp::Update(at, offset)),
        1 => any::<usize>().prop_map(HeapOp::Remove),
        1 => Just(HeapOp::Dequeue),
    ]
}

fn test_store() -> CacheStore<String> {
    let config = CacheConfig::default().with_water_marks(TEST_HIGH_WATER_MARK, TEST_LOW_WATER_MARK);
    CacheStore::with_clock(config, Arc::new(ManualClock::default())).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // The heap always yields deadlines in order and its back-pointers follow
    // every enqueue, update and removal.
    #[test]
    fn prop_heap_dequeues_in_deadline_order(ops in prop::collection::vec(heap_op_strategy(), 1..200)) {
        let now = Utc::now();
        let mut arena: EntryArena<u32> = EntryArena::new();
        let mut heap = ExpiryHeap::new();
        let mut queued: Vec<EntryId> = Vec::new();

        for op in ops {
            match op {
                HeapOp::Enqueue(offset) => {
                    let id = arena.insert(CacheEntry::new("k".to_string(), 0, CacheItemPriority::Normal, now));
                    heap.enqueue(&mut arena, id, now + chrono::Duration::milliseconds(offset));
                    queued.push(id);
                }
                HeapOp::Update(at, offset) if !queued.is_empty() => {
                    let id = queued[at % queued.len()];
                    prop_assert!(heap.update(&mut arena, id, now + chrono::Duration::milliseconds(offset)));
                }
                HeapOp::Remove(at) if !queued.is_empty() => {
                    let id = queued.swap_remove(at % queued.len());
                    prop_assert!(heap.remove(&mut arena, id));
                    prop_assert_eq!(arena.heap_index(id), None);
                }
                HeapOp::Dequeue => {
                    if let Some(node) = heap.dequeue(&mut arena) {
                        queued.retain(|id| *id != node.id);
                    }
                }
                _ => {}
            }
            prop_assert_eq!(heap.len(), queued.len());
            for id in &queued {
                prop_assert!(arena.heap_index(*id).is_some());
            }
        }

        let mut previous = None;
        while let Some(node) = heap.dequeue(&mut arena) {
            if let Some(previous) = previous {
                prop_assert!(previous <= node.expires_at, "Heap yielded deadlines out of order");
            }
            previous = Some(node.expires_at);
        }
    }

    // Hits and misses match what the caller observed, and the entry count
    // matches the store length.
    #[test]
    fn prop_statistics_accuracy(ops in prop::collection::vec(cache_op_strategy(), 1..80)) {
        let store = test_store();
        let mut expected_hits: u64 = 0;
        let mut expected_misses: u64 = 0;

        for op in ops {
            match op {
                CacheOp::Insert { key, value } | CacheOp::InsertPinned { key, value } => {
                    store.insert(key, value).unwrap();
                }
                CacheOp::Add { key, value } => {
                    store.add(key, value, CacheItemOptions::new()).unwrap();
                }
                CacheOp::Get { key } => {
                    match store.get(&key) {
                        Some(_) => expected_hits += 1,
                        None => expected_misses += 1,
                    }
                }
                CacheOp::Remove { key } => {
                    store.remove(&key);
                }
            }
        }

        let stats = store.stats();
        prop_assert_eq!(stats.hits, expected_hits, "Hits mismatch");
        prop_assert_eq!(stats.misses, expected_misses, "Misses mismatch");
        prop_assert_eq!(stats.total_entries, store.len(), "Total entries mismatch");
    }

    // Eviction never drops a NotRemovable entry, and the removable entries
    // stay under the high-water mark after every insert.
    #[test]
    fn prop_eviction_spares_not_removable(ops in prop::collection::vec(cache_op_strategy(), 1..200)) {
        let store = test_store();
        let mut pinned: HashSet<String> = HashSet::new();

        for op in ops {
            match op {
                CacheOp::Insert { key, value } => {
                    store.insert(key.clone(), value).unwrap();
                    pinned.remove(&key);
                }
                CacheOp::InsertPinned { key, value } => {
                    let options = CacheItemOptions::new().priority(CacheItemPriority::NotRemovable);
                    store.insert_with(key.clone(), value, options).unwrap();
                    pinned.insert(key);
                }
                CacheOp::Add { key, value } => {
                    store.add(key, value, CacheItemOptions::new()).unwrap();
                }
                CacheOp::Get { key } => {
                    store.get(&key);
                }
                CacheOp::Remove { key } => {
                    store.remove(&key);
                    pinned.remove(&key);
                }
            }

            for key in &pinned {
                prop_assert!(store.contains_key(key), "Pinned key '{}' was evicted", key);
            }
            prop_assert!(
                store.len() - pinned.len() < TEST_HIGH_WATER_MARK,
                "{} removable entries at high-water mark {}",
                store.len() - pinned.len(),
                TEST_HIGH_WATER_MARK
            );
        }
    }

    // Storing a value and reading it back before any deadline returns it.
    #[test]
    fn prop_roundtrip_storage(key in valid_key_strategy(), value in valid_value_strategy()) {
        let store = test_store();

        store.insert(key.clone(), value.clone()).unwrap();

        prop_assert_eq!(store.get(&key), Some(value), "Round-trip value mismatch");
    }

    // `add` keeps the first value, `insert` always keeps the last one.
    #[test]
    fn prop_add_versus_insert(
        key in valid_key_strategy(),
        values in prop::collection::vec(valid_value_strategy(), 1..10)
    ) {
        let added = test_store();
        let inserted = test_store();

        for value in &values {
            added.add(key.clone(), value.clone(), CacheItemOptions::new()).unwrap();
            inserted.insert(key.clone(), value.clone()).unwrap();
        }

        prop_assert_eq!(added.get(&key), values.first().cloned());
        prop_assert_eq!(inserted.get(&key), values.last().cloned());
        prop_assert_eq!(added.len(), 1);
        prop_assert_eq!(inserted.len(), 1);
    }

    // The snapshot enumerator matches a model of the latest insert per key.
    #[test]
    fn prop_snapshot_matches_model(
        entries in prop::collection::vec((valid_key_strategy(), valid_value_strategy()), 1..15)
    ) {
        let store = test_store();
        let mut model: HashMap<String, String> = HashMap::new();

        for (key, value) in entries {
            store.insert(key.clone(), value.clone()).unwrap();
            model.insert(key, value);
        }

        let snapshot: HashMap<String, String> = store.iter().collect();
        prop_assert_eq!(snapshot, model);
    }
}
