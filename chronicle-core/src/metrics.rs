//! # Metrics
//!
//! Lock-free counters shared by the writer, chaser, index and scavenger.
//! Cloning a [`Metrics`] handle is cheap; all clones update the same counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Write path
    write_batches: AtomicU64,
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
    chunks_completed: AtomicU64,

    // Chaser / index
    records_chased: AtomicU64,
    index_entries_added: AtomicU64,
    memtable_flushes: AtomicU64,
    ptable_merges: AtomicU64,

    // Read path
    reads: AtomicU64,
    read_retries: AtomicU64,

    // Scavenge
    scavenge_passes: AtomicU64,
    chunks_scavenged: AtomicU64,
    records_discarded: AtomicU64,
    bytes_reclaimed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flushed write batch
    pub fn record_write_batch(&self, records: u64, bytes: u64) {
        self.inner.write_batches.fetch_add(1, Ordering::Relaxed);
        self.inner.records_written.fetch_add(records, Ordering::Relaxed);
        self.inner.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.inner.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_completed(&self) {
        self.inner.chunks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chased(&self, records: u64, index_entries: u64) {
        self.inner.records_chased.fetch_add(records, Ordering::Relaxed);
        self.inner.index_entries_added.fetch_add(index_entries, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.inner.memtable_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.inner.ptable_merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self) {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// A read restarted because a chunk was swapped underneath it
    pub fn record_read_retry(&self) {
        self.inner.read_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scavenge_pass(&self) {
        self.inner.scavenge_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_scavenged(&self, records_discarded: u64, bytes_reclaimed: u64) {
        self.inner.chunks_scavenged.fetch_add(1, Ordering::Relaxed);
        self.inner.records_discarded.fetch_add(records_discarded, Ordering::Relaxed);
        self.inner.bytes_reclaimed.fetch_add(bytes_reclaimed, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            write_batches: i.write_batches.load(Ordering::Relaxed),
            records_written: i.records_written.load(Ordering::Relaxed),
            bytes_written: i.bytes_written.load(Ordering::Relaxed),
            write_errors: i.write_errors.load(Ordering::Relaxed),
            chunks_completed: i.chunks_completed.load(Ordering::Relaxed),
            records_chased: i.records_chased.load(Ordering::Relaxed),
            index_entries_added: i.index_entries_added.load(Ordering::Relaxed),
            memtable_flushes: i.memtable_flushes.load(Ordering::Relaxed),
            ptable_merges: i.ptable_merges.load(Ordering::Relaxed),
            reads: i.reads.load(Ordering::Relaxed),
            read_retries: i.read_retries.load(Ordering::Relaxed),
            scavenge_passes: i.scavenge_passes.load(Ordering::Relaxed),
            chunks_scavenged: i.chunks_scavenged.load(Ordering::Relaxed),
            records_discarded: i.records_discarded.load(Ordering::Relaxed),
            bytes_reclaimed: i.bytes_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub write_batches: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub chunks_completed: u64,
    pub records_chased: u64,
    pub index_entries_added: u64,
    pub memtable_flushes: u64,
    pub ptable_merges: u64,
    pub reads: u64,
    pub read_retries: u64,
    pub scavenge_passes: u64,
    pub chunks_scavenged: u64,
    pub records_discarded: u64,
    pub bytes_reclaimed: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let other = metrics.clone();

        metrics.record_write_batch(3, 300);
        other.record_write_batch(1, 50);
        other.record_chunk_scavenged(10, 4096);

        let snap = metrics.snapshot();
        assert_eq!(snap.write_batches, 2);
        assert_eq!(snap.records_written, 4);
        assert_eq!(snap.bytes_written, 350);
        assert_eq!(snap.chunks_scavenged, 1);
        assert_eq!(snap.bytes_reclaimed, 4096);
    }
}
