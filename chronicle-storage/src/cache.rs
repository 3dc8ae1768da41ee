//! # Stream Info Cache
//!
//! LRU of per-stream facts (last event number, deletion) that would
//! otherwise need an index lookup plus a log read to establish.
//!
//! The cache is a hint. Entries only move forward: a stale value can be
//! replaced by a newer one, never the other way round.
//!
//! Readers that load a missing entry from the index stamp it with the load
//! generation taken before the lookup. A commit for an uncached stream bumps
//! the generation, so a load that raced with it is dropped instead of
//! stored.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCacheInfo {
    pub last_event_number: Option<i32>,
    pub is_deleted: bool,
}

impl StreamCacheInfo {
    fn merge(self, other: StreamCacheInfo) -> StreamCacheInfo {
        StreamCacheInfo {
            last_event_number: self.last_event_number.max(other.last_event_number),
            is_deleted: self.is_deleted || other.is_deleted,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct StreamInfoCache {
    entries: Mutex<LruCache<String, StreamCacheInfo>>,
    /// Bumped under the `entries` lock by commits no entry absorbed.
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StreamInfoCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamCacheInfo> {
        let found = self.entries.lock().get(stream_id).copied();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store `info`, merging with what is already cached.
    pub fn put(&self, stream_id: &str, info: StreamCacheInfo) {
        let mut entries = self.entries.lock();
        let merged = match entries.get(stream_id) {
            Some(existing) => existing.merge(info),
            None => info,
        };
        entries.put(stream_id.to_string(), merged);
    }

    /// Generation to pass to [`put_loaded`](Self::put_loaded). Take it
    /// before reading the index.
    pub fn load_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store `info` loaded from the index, unless a commit for an uncached
    /// stream was applied since `generation`. Returns whether it was stored.
    pub fn put_loaded(&self, stream_id: &str, info: StreamCacheInfo, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        let merged = match entries.get(stream_id) {
            Some(existing) => existing.merge(info),
            None => info,
        };
        entries.put(stream_id.to_string(), merged);
        true
    }

    /// Refresh a stream the chaser just indexed a commit for. Call after the
    /// index holds the commit. Streams not in the cache are left alone and
    /// in-flight loads are invalidated.
    pub fn on_commit(&self, stream_id: &str, last_event_number: i32, is_deleted: bool) {
        let mut entries = self.entries.lock();
        match entries.get_mut(stream_id) {
            Some(existing) => {
                *existing = existing.merge(StreamCacheInfo {
                    last_event_number: Some(last_event_number),
                    is_deleted,
                });
            }
            None => {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn invalidate(&self, stream_id: &str) {
        self.entries.lock().pop(stream_id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
