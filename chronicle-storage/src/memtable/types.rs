use serde::{Deserialize, Serialize};

/// One index entry: event `event_number` of the stream hashing to
/// `stream_hash` lives at log `position`.
///
/// Ordering is by hash, then event number, then position. Two streams that
/// share a hash can own entries with the same event number; those differ in
/// position and are kept side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: i32,
    pub position: u64,
}

impl IndexEntry {
    pub fn new(stream_hash: u64, event_number: i32, position: u64) -> Self {
        Self { stream_hash, event_number, position }
    }

    /// Smallest entry for `(stream_hash, event_number)`.
    pub fn lower_bound(stream_hash: u64, event_number: i32) -> Self {
        Self { stream_hash, event_number, position: 0 }
    }

    /// Largest entry for `(stream_hash, event_number)`.
    pub fn upper_bound(stream_hash: u64, event_number: i32) -> Self {
        Self { stream_hash, event_number, position: u64::MAX }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemTableStats {
    pub entry_count: usize,
    pub max_entries: usize,
    /// Log position up to which this memtable has been fed.
    pub applied_position: u64,
    pub age_ms: u64,
}
