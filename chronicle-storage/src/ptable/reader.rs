use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapOptions};

use chronicle_core::error::{Error, Result};

use super::iterator::PTableIterator;
use super::types::*;
use crate::memtable::IndexEntry;

/// An immutable, memory-mapped index table.
pub struct PTable {
    info: PTableInfo,
    path: PathBuf,
    mmap: Mmap,
    len: usize,
}

impl PTable {
    /// Open `info.file_name` in `dir`, validating header and entry checksum
    /// against what the manifest recorded.
    pub fn open(dir: &Path, info: &PTableInfo) -> Result<Self> {
        let path = dir.join(&info.file_name);
        let file = File::open(&path).map_err(|e| Error::PTable {
            message: format!("Failed to open PTable {:?}", path),
            source: Some(Box::new(e)),
        })?;

        let mmap = unsafe {
            MmapOptions::new().map(&file).map_err(|e| Error::PTable {
                message: format!("Failed to mmap PTable {:?}", path),
                source: Some(Box::new(e)),
            })?
        };

        if mmap.len() < PTABLE_HEADER_SIZE {
            return Err(corrupt(&path, "file too small for header"));
        }
        if &mmap[0..8] != PTABLE_MAGIC {
            return Err(corrupt(&path, "invalid magic"));
        }
        let version = LittleEndian::read_u32(&mmap[8..12]);
        if version != PTABLE_VERSION {
            return Err(corrupt(&path, &format!("unsupported version {}", version)));
        }
        let level = LittleEndian::read_u32(&mmap[12..16]);
        let entry_count = LittleEndian::read_u64(&mmap[16..24]);
        let checksum = LittleEndian::read_u32(&mmap[24..28]);

        let expected_len = PTABLE_HEADER_SIZE as u64 + entry_count * PTABLE_ENTRY_SIZE as u64;
        if expected_len != mmap.len() as u64 {
            return Err(corrupt(
                &path,
                &format!("{} entries do not match file length {}", entry_count, mmap.len()),
            ));
        }
        if level != info.level || entry_count != info.entry_count {
            return Err(corrupt(&path, "header disagrees with manifest"));
        }
        if crc32fast::hash(&mmap[PTABLE_HEADER_SIZE..]) != checksum {
            return Err(corrupt(&path, "entry checksum mismatch"));
        }

        Ok(Self {
            info: info.clone(),
            path,
            mmap,
            len: entry_count as usize,
        })
    }

    pub fn info(&self) -> &PTableInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn level(&self) -> u32 {
        self.info.level
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entry_at(&self, index: usize) -> IndexEntry {
        let start = PTABLE_HEADER_SIZE + index * PTABLE_ENTRY_SIZE;
        decode_entry(&self.mmap[start..start + PTABLE_ENTRY_SIZE])
    }

    /// Index of the first entry not less than `key`.
    pub fn lower_bound(&self, key: &IndexEntry) -> usize {
        self.partition_point(|entry| entry < *key)
    }

    /// Index of the first entry greater than `key`.
    pub fn upper_bound(&self, key: &IndexEntry) -> usize {
        self.partition_point(|entry| entry <= *key)
    }

    fn partition_point(&self, pred: impl Fn(IndexEntry) -> bool) -> usize {
        let (mut lo, mut hi) = (0usize, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.entry_at(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Positions recorded for `(stream_hash, event_number)`, ascending.
    pub fn get(&self, stream_hash: u64, event_number: i32) -> Vec<u64> {
        self.range(stream_hash, event_number, event_number)
            .into_iter()
            .map(|e| e.position)
            .collect()
    }

    /// Entries with event numbers in `[from, to]`, ascending.
    pub fn range(&self, stream_hash: u64, from: i32, to: i32) -> Vec<IndexEntry> {
        if from > to {
            return Vec::new();
        }
        let upper = IndexEntry::upper_bound(stream_hash, to);
        let mut out = Vec::new();
        let mut i = self.lower_bound(&IndexEntry::lower_bound(stream_hash, from));
        while i < self.len {
            let entry = self.entry_at(i);
            if entry > upper {
                break;
            }
            out.push(entry);
            i += 1;
        }
        out
    }

    /// Entries sharing the highest event number for `stream_hash`.
    pub fn latest(&self, stream_hash: u64) -> Vec<IndexEntry> {
        let end = self.upper_bound(&IndexEntry::upper_bound(stream_hash, i32::MAX));
        if end == 0 {
            return Vec::new();
        }
        let last = self.entry_at(end - 1);
        if last.stream_hash != stream_hash {
            return Vec::new();
        }
        self.range(stream_hash, last.event_number, last.event_number)
    }

    pub fn contains(&self, entry: &IndexEntry) -> bool {
        let i = self.lower_bound(entry);
        i < self.len && self.entry_at(i) == *entry
    }

    pub fn iter(&self) -> PTableIterator<'_> {
        PTableIterator::new(self)
    }
}

fn corrupt(path: &Path, reason: &str) -> Error {
    Error::PTable {
        message: format!("Corrupted PTable {:?}: {}", path, reason),
        source: None,
    }
}

impl std::fmt::Debug for PTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PTable")
            .field("id", &self.info.id)
            .field("level", &self.info.level)
            .field("entries", &self.len)
            .finish()
    }
}
