//! # Index Merging
//!
//! PTables are grouped in levels. A flushed memtable lands in level 0; when a
//! level holds `max_tables_per_level` tables they are merged into one table
//! of the next level. Merging never drops entries except exact duplicates,
//! so streams whose names collide on the hash keep all their entries.
//!
//! Scavenging moves records inside a chunk. [`rewrite_table`] applies such a
//! relocation to an existing table.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use chronicle_core::Result;

use crate::memtable::IndexEntry;
use crate::ptable::{PTable, PTableInfo, PTableIterator, PTableWriter};

/// Old log position to its new position, or `None` when the record is gone.
pub type RelocationMap = HashMap<u64, Option<u64>>;

/// Tables chosen for one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTask {
    pub level: u32,
    pub inputs: Vec<PTableInfo>,
}

impl MergeTask {
    pub fn output_level(&self) -> u32 {
        self.level + 1
    }
}

/// Merge selection policy
pub trait MergePolicy: Send + Sync {
    /// Pick the next set of tables to merge, if any.
    fn select_merge(&self, tables: &[PTableInfo]) -> Option<MergeTask>;
}

/// Merge a level once it holds a fixed number of tables.
pub struct LevelMergePolicy {
    max_tables_per_level: usize,
}

impl LevelMergePolicy {
    pub fn new(max_tables_per_level: usize) -> Self {
        Self {
            max_tables_per_level: max_tables_per_level.max(2),
        }
    }
}

impl MergePolicy for LevelMergePolicy {
    fn select_merge(&self, tables: &[PTableInfo]) -> Option<MergeTask> {
        let mut levels: BTreeMap<u32, Vec<PTableInfo>> = BTreeMap::new();
        for table in tables {
            levels.entry(table.level).or_default().push(table.clone());
        }

        levels
            .into_iter()
            .find(|(_, tables)| tables.len() >= self.max_tables_per_level)
            .map(|(level, mut inputs)| {
                inputs.sort_by_key(|t| t.id);
                MergeTask { level, inputs }
            })
    }
}

/// K-way merge of sorted tables into `output`.
///
/// Entries are ordered by `(hash, number, position)`. Identical entries,
/// such as one written again by an index replay, collapse into one. Entries
/// that share `(hash, number)` but point at different positions are all
/// kept: a stream hash does not identify a stream, so they can belong to
/// different streams, and keeping only the newest would lose an event of
/// the other one. Readers resolve them by comparing the stream id stored in
/// the record. Scavenge relocation rewrites positions in place, so a single
/// stream never ends up with two live entries for one event number.
pub fn merge_tables(tables: &[&PTable], mut output: PTableWriter) -> Result<PTableInfo> {
    let mut iters: Vec<PTableIterator<'_>> = tables.iter().map(|t| t.iter()).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());

    for (i, iter) in iters.iter_mut().enumerate() {
        if let Some(entry) = iter.next() {
            heap.push(Reverse((entry, i)));
        }
    }

    while let Some(Reverse((entry, i))) = heap.pop() {
        output.add(entry)?;
        if let Some(next) = iters[i].next() {
            heap.push(Reverse((next, i)));
        }
    }

    output.finish()
}

/// Whether any entry of `table` points into `[start, end)`.
pub fn table_touches(table: &PTable, start: u64, end: u64) -> bool {
    table.iter().any(|e| e.position >= start && e.position < end)
}

/// Apply a relocation to a set of entries, keeping the result sorted.
pub fn relocate_entries(
    entries: impl IntoIterator<Item = IndexEntry>,
    relocations: &RelocationMap,
) -> Vec<IndexEntry> {
    let mut out: Vec<IndexEntry> = entries
        .into_iter()
        .filter_map(|entry| match relocations.get(&entry.position) {
            None => Some(entry),
            Some(Some(new_position)) => Some(IndexEntry {
                position: *new_position,
                ..entry
            }),
            Some(None) => None,
        })
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Rewrite `table` with `relocations` applied.
pub fn rewrite_table(table: &PTable, relocations: &RelocationMap, mut output: PTableWriter) -> Result<PTableInfo> {
    for entry in relocate_entries(table.iter(), relocations) {
        output.add(entry)?;
    }
    output.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptable::write_ptable;
    use tempfile::TempDir;

    fn info(id: u64, level: u32) -> PTableInfo {
        PTableInfo {
            id,
            level,
            file_name: crate::ptable::ptable_file_name(id),
            entry_count: 1,
        }
    }

    #[test]
    fn test_policy_picks_lowest_full_level() {
        let policy = LevelMergePolicy::new(2);
        assert!(policy.select_merge(&[info(1, 0), info(2, 1)]).is_none());

        let task = policy
            .select_merge(&[info(5, 1), info(4, 0), info(3, 1), info(6, 0)])
            .unwrap();
        assert_eq!(task.level, 0);
        assert_eq!(task.output_level(), 1);
        assert_eq!(task.inputs.iter().map(|t| t.id).collect::<Vec<_>>(), vec![4, 6]);
    }

    #[test]
    fn test_merge_keeps_collisions_and_drops_duplicates() {
        let dir = TempDir::new().unwrap();
        let a = write_ptable(
            dir.path(),
            1,
            0,
            vec![IndexEntry::new(1, 0, 10), IndexEntry::new(2, 0, 30)],
        )
        .unwrap();
        let b = write_ptable(
            dir.path(),
            2,
            0,
            vec![
                IndexEntry::new(1, 0, 10),
                IndexEntry::new(1, 0, 20),
                IndexEntry::new(3, 4, 40),
            ],
        )
        .unwrap();

        let a = PTable::open(dir.path(), &a).unwrap();
        let b = PTable::open(dir.path(), &b).unwrap();
        let writer = PTableWriter::create(dir.path(), 3, 1).unwrap();
        let merged = merge_tables(&[&a, &b], writer).unwrap();
        assert_eq!(merged.level, 1);
        assert_eq!(merged.entry_count, 4);

        let merged = PTable::open(dir.path(), &merged).unwrap();
        assert_eq!(merged.get(1, 0), vec![10, 20]);
    }

    #[test]
    fn test_relocation() {
        let mut relocations = RelocationMap::new();
        relocations.insert(100, Some(40));
        relocations.insert(200, None);

        let out = relocate_entries(
            vec![
                IndexEntry::new(1, 0, 100),
                IndexEntry::new(1, 1, 200),
                IndexEntry::new(2, 0, 50),
            ],
            &relocations,
        );
        assert_eq!(out, vec![IndexEntry::new(1, 0, 40), IndexEntry::new(2, 0, 50)]);
    }
}
