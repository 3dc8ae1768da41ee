use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_skiplist::SkipSet;

use super::types::{IndexEntry, MemTableStats};

pub struct MemTable {
    data: SkipSet<IndexEntry>,
    entry_count: AtomicUsize,
    max_entries: usize,
    applied_position: AtomicU64,
    created_at: Instant,
}

impl MemTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            data: SkipSet::new(),
            entry_count: AtomicUsize::new(0),
            max_entries,
            applied_position: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Build a memtable holding `entries`, e.g. after a relocation.
    pub fn from_entries(max_entries: usize, entries: impl IntoIterator<Item = IndexEntry>, applied_position: u64) -> Self {
        let table = Self::new(max_entries);
        for entry in entries {
            table.add(entry);
        }
        table.applied_position.store(applied_position, Ordering::Release);
        table
    }

    /// Insert an entry. Returns `false` if it was already present.
    pub fn add(&self, entry: IndexEntry) -> bool {
        if self.data.contains(&entry) {
            return false;
        }
        self.data.insert(entry);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Record that the log up to `position` has been applied.
    pub fn set_applied_position(&self, position: u64) {
        self.applied_position.fetch_max(position, Ordering::AcqRel);
    }

    pub fn applied_position(&self) -> u64 {
        self.applied_position.load(Ordering::Acquire)
    }

    /// Positions of `(stream_hash, event_number)`, ascending.
    pub fn get(&self, stream_hash: u64, event_number: i32) -> Vec<u64> {
        self.data
            .range(IndexEntry::lower_bound(stream_hash, event_number)..=IndexEntry::upper_bound(stream_hash, event_number))
            .map(|e| e.value().position)
            .collect()
    }

    /// Entries with event numbers in `[from, to]`, ascending.
    pub fn range(&self, stream_hash: u64, from: i32, to: i32) -> Vec<IndexEntry> {
        if from > to {
            return Vec::new();
        }
        self.data
            .range(IndexEntry::lower_bound(stream_hash, from)..=IndexEntry::upper_bound(stream_hash, to))
            .map(|e| *e.value())
            .collect()
    }

    /// Entries sharing the highest event number for `stream_hash`.
    pub fn latest(&self, stream_hash: u64) -> Vec<IndexEntry> {
        let last = self
            .data
            .range(IndexEntry::lower_bound(stream_hash, i32::MIN)..=IndexEntry::upper_bound(stream_hash, i32::MAX))
            .next_back()
            .map(|e| *e.value());
        match last {
            Some(entry) => self.range(stream_hash, entry.event_number, entry.event_number),
            None => Vec::new(),
        }
    }

    /// All entries in sorted order.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.data.iter().map(|e| *e.value()).collect()
    }

    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_entries
    }

    pub fn stats(&self) -> MemTableStats {
        MemTableStats {
            entry_count: self.len(),
            max_entries: self.max_entries,
            applied_position: self.applied_position(),
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }
}
