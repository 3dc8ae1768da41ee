//! # Table Index Tests
//!
//! Tests for:
//! - lookups spanning memtable and every PTable level
//! - level merges and their persistence across reopen
//! - agreement with an in-memory model under random inserts

use std::collections::BTreeMap;

use tempfile::TempDir;

use chronicle_core::{config::IndexConfig, metrics::Metrics};
use chronicle_storage::{IndexEntry, TableIndex};

fn small_config() -> IndexConfig {
    IndexConfig {
        memtable_max_entries: 4,
        max_tables_per_level: 2,
    }
}

fn open(dir: &TempDir) -> TableIndex {
    TableIndex::open(dir.path(), &small_config(), Metrics::new()).unwrap()
}

#[test]
fn test_merges_cascade_through_levels() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir);

    // 64 entries => 16 flushes => a single level-4 table after cascading merges
    for n in 0..64 {
        let entry = IndexEntry::new(7, n, 1000 + n as u64 * 10);
        index.add(&[entry], 1000 + (n as u64 + 1) * 10).unwrap();
    }

    let stats = index.stats();
    assert_eq!(stats.memtable_entries, 0);
    assert_eq!(stats.persisted_entries, 64);
    assert_eq!(stats.levels.values().sum::<usize>(), stats.table_count);
    assert!(stats.levels.values().all(|&count| count < 2));
    assert_eq!(stats.persisted_position, 1640);

    for n in [0, 17, 31, 63] {
        assert_eq!(index.get(7, n), vec![1000 + n as u64 * 10]);
    }
    let range = index.range(7, 10, 13);
    assert_eq!(range.iter().map(|e| e.event_number).collect::<Vec<_>>(), vec![10, 11, 12, 13]);
    assert_eq!(index.latest_candidates(7)[0].event_number, 63);
}

#[test]
fn test_lookup_spans_memtable_and_tables() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir);

    let entries: Vec<IndexEntry> = (0..6).map(|n| IndexEntry::new(42, n, n as u64 * 100)).collect();
    index.add(&entries[..4], 400).unwrap();
    index.add(&entries[4..], 600).unwrap();

    let stats = index.stats();
    assert_eq!(stats.table_count, 1);
    assert_eq!(stats.memtable_entries, 2);

    assert_eq!(index.get(42, 1), vec![100]);
    assert_eq!(index.get(42, 5), vec![500]);
    assert_eq!(index.range(42, 0, i32::MAX).len(), 6);
    assert!(index.get(43, 0).is_empty());
}

#[test]
fn test_reopen_keeps_tables_and_position() {
    let dir = TempDir::new().unwrap();

    {
        let index = open(&dir);
        for n in 0..10 {
            index.add(&[IndexEntry::new(1, n, n as u64)], n as u64 + 1).unwrap();
        }
        index.flush().unwrap();
        assert_eq!(index.persisted_position(), 10);
    }

    let index = open(&dir);
    assert_eq!(index.persisted_position(), 10);
    assert_eq!(index.applied_position(), 10);
    assert_eq!(index.range(1, 0, 9).len(), 10);
    assert_eq!(index.stats().persisted_entries, 10);
}

#[test]
fn test_colliding_streams_are_both_kept() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir);

    for n in 0..8 {
        index.add(&[IndexEntry::new(99, 0, n as u64 * 1000)], (n as u64 + 1) * 1000).unwrap();
    }
    index.flush().unwrap();

    let positions = index.get(99, 0);
    assert_eq!(positions, (0..8).map(|n| n as u64 * 1000).collect::<Vec<_>>());
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_index_matches_model(
            keys in prop::collection::btree_set((0u64..6, 0i32..50), 1..120)
        ) {
            let dir = TempDir::new().unwrap();
            let index = open(&dir);
            let mut model: BTreeMap<(u64, i32), u64> = BTreeMap::new();

            for (i, (hash, number)) in keys.iter().enumerate() {
                let position = i as u64 * 64;
                index.add(&[IndexEntry::new(*hash, *number, position)], position + 64).unwrap();
                model.insert((*hash, *number), position);
            }

            for ((hash, number), position) in &model {
                prop_assert_eq!(index.get(*hash, *number), vec![*position]);
            }
            for hash in 0u64..6 {
                let expected: Vec<i32> = model.keys().filter(|(h, _)| *h == hash).map(|(_, n)| *n).collect();
                let actual: Vec<i32> = index.range(hash, 0, i32::MAX).iter().map(|e| e.event_number).collect();
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
