//! # Table Index
//!
//! Maps `(stream hash, event number)` to log positions.
//!
//! ```text
//!   chaser ──add──▶ MemTable (skip list)
//!                      │ full
//!                      ▼ flush
//!                  level 0: [PTable] [PTable]
//!                      │ max_tables_per_level reached
//!                      ▼ merge
//!                  level 1: [PTable] ...
//! ```
//!
//! Readers work on an immutable snapshot (`Arc<IndexSnapshot>`) swapped in
//! after every flush, merge or relocation, so lookups never wait on those.
//! All mutations are serialized through the manifest lock.
//!
//! Lookups return *candidates*: two streams may share a hash, so the caller
//! has to read the record and compare stream ids.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use chronicle_core::{
    config::IndexConfig,
    error::{Error, Result},
    metrics::Metrics,
};

use crate::compaction::{
    merge_tables, relocate_entries, rewrite_table, table_touches, LevelMergePolicy, MergePolicy,
    RelocationMap,
};
use crate::manifest::{IndexManifest, MANIFEST_FILE};
use crate::memtable::{IndexEntry, MemTable};
use crate::ptable::{write_ptable, PTable, PTableInfo, PTableWriter};

struct IndexSnapshot {
    memtable: Arc<MemTable>,
    /// Ordered by level, newest first within a level.
    tables: Vec<Arc<PTable>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub memtable_entries: usize,
    pub table_count: usize,
    pub persisted_entries: u64,
    pub levels: BTreeMap<u32, usize>,
    pub persisted_position: u64,
}

pub struct TableIndex {
    dir: PathBuf,
    config: IndexConfig,
    state: RwLock<Arc<IndexSnapshot>>,
    manifest: Mutex<IndexManifest>,
    policy: Box<dyn MergePolicy>,
    metrics: Metrics,
}

impl TableIndex {
    pub fn open(dir: impl AsRef<Path>, config: &IndexConfig, metrics: Metrics) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Io {
            message: format!("Failed to create index directory: {:?}", dir),
            source: e,
        })?;

        let manifest = IndexManifest::load_or_create(&dir)?;
        remove_stray_files(&dir, &manifest)?;

        let mut tables = Vec::with_capacity(manifest.tables.len());
        for info in &manifest.tables {
            tables.push(Arc::new(PTable::open(&dir, info)?));
        }
        sort_tables(&mut tables);

        let memtable = MemTable::new(config.memtable_max_entries);
        memtable.set_applied_position(manifest.persisted_position);

        info!(
            tables = tables.len(),
            persisted_position = manifest.persisted_position,
            "Table index opened"
        );

        Ok(Self {
            dir,
            config: config.clone(),
            state: RwLock::new(Arc::new(IndexSnapshot {
                memtable: Arc::new(memtable),
                tables,
            })),
            manifest: Mutex::new(manifest),
            policy: Box::new(LevelMergePolicy::new(config.max_tables_per_level)),
            metrics,
        })
    }

    fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.state.read().clone()
    }

    fn install(&self, memtable: Arc<MemTable>, mut tables: Vec<Arc<PTable>>) {
        sort_tables(&mut tables);
        *self.state.write() = Arc::new(IndexSnapshot { memtable, tables });
    }

    /// Add entries produced by the log up to `applied_position`, flushing
    /// the memtable when it fills up.
    pub fn add(&self, entries: &[IndexEntry], applied_position: u64) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let snapshot = self.snapshot();
        for entry in entries {
            snapshot.memtable.add(*entry);
        }
        snapshot.memtable.set_applied_position(applied_position);

        if snapshot.memtable.is_full() {
            self.flush_locked(&mut manifest)?;
        }
        Ok(())
    }

    /// Persist the memtable (if non-empty) and the applied position.
    pub fn flush(&self) -> Result<()> {
        let mut manifest = self.manifest.lock();
        self.flush_locked(&mut manifest)
    }

    fn flush_locked(&self, manifest: &mut IndexManifest) -> Result<()> {
        let snapshot = self.snapshot();
        let applied = snapshot.memtable.applied_position();
        let mut tables = snapshot.tables.clone();

        if !snapshot.memtable.is_empty() {
            let id = manifest.allocate_table_id();
            let info = write_ptable(&self.dir, id, 0, snapshot.memtable.entries())?;
            tables.push(Arc::new(PTable::open(&self.dir, &info)?));
            debug!(table = id, entries = info.entry_count, "Flushed memtable");
            manifest.add_table(info);
        } else if applied <= manifest.persisted_position {
            return Ok(());
        }

        manifest.persisted_position = manifest.persisted_position.max(applied);
        manifest.save(&self.dir)?;

        let memtable = MemTable::new(self.config.memtable_max_entries);
        memtable.set_applied_position(applied);
        self.install(Arc::new(memtable), tables);
        self.metrics.record_flush();

        self.merge_locked(manifest)
    }

    fn merge_locked(&self, manifest: &mut IndexManifest) -> Result<()> {
        while let Some(task) = self.policy.select_merge(&manifest.tables) {
            let snapshot = self.snapshot();
            let input_ids: Vec<u64> = task.inputs.iter().map(|t| t.id).collect();
            let inputs: Vec<&PTable> = snapshot
                .tables
                .iter()
                .filter(|t| input_ids.contains(&t.id()))
                .map(|t| t.as_ref())
                .collect();
            if inputs.len() != input_ids.len() {
                return Err(Error::Internal {
                    message: format!("merge inputs {:?} are not all loaded", input_ids),
                });
            }

            let id = manifest.allocate_table_id();
            let writer = PTableWriter::create(&self.dir, id, task.output_level())?;
            let info = merge_tables(&inputs, writer)?;
            let merged = Arc::new(PTable::open(&self.dir, &info)?);

            info!(
                level = task.level,
                inputs = input_ids.len(),
                output = id,
                entries = info.entry_count,
                "Merged index tables"
            );

            manifest.remove_tables(&input_ids);
            manifest.add_table(info);
            manifest.save(&self.dir)?;

            let mut tables: Vec<Arc<PTable>> = snapshot
                .tables
                .iter()
                .filter(|t| !input_ids.contains(&t.id()))
                .cloned()
                .collect();
            tables.push(merged);
            self.install(snapshot.memtable.clone(), tables);
            self.metrics.record_merge();

            drop(inputs);
            drop(snapshot);
            self.remove_files(&task.inputs);
        }
        Ok(())
    }

    fn remove_files(&self, tables: &[PTableInfo]) {
        for table in tables {
            let path = self.dir.join(&table.file_name);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove obsolete index table {:?}: {}", path, e);
            }
        }
    }

    /// Candidate positions of event `event_number` of streams hashing to
    /// `stream_hash`, ascending.
    pub fn get(&self, stream_hash: u64, event_number: i32) -> Vec<u64> {
        let snapshot = self.snapshot();
        let mut positions = snapshot.memtable.get(stream_hash, event_number);
        for table in &snapshot.tables {
            positions.extend(table.get(stream_hash, event_number));
        }
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    /// Entries with event numbers in `[from, to]`, ascending.
    pub fn range(&self, stream_hash: u64, from: i32, to: i32) -> Vec<IndexEntry> {
        let snapshot = self.snapshot();
        let mut entries = snapshot.memtable.range(stream_hash, from, to);
        for table in &snapshot.tables {
            entries.extend(table.range(stream_hash, from, to));
        }
        entries.sort_unstable();
        entries.dedup();
        entries
    }

    /// Highest-numbered entries per source, highest first.
    ///
    /// Under a hash collision the top entry may belong to another stream;
    /// callers fall back to [`TableIndex::range`] when none verifies.
    pub fn latest_candidates(&self, stream_hash: u64) -> Vec<IndexEntry> {
        let snapshot = self.snapshot();
        let mut entries = snapshot.memtable.latest(stream_hash);
        for table in &snapshot.tables {
            entries.extend(table.latest(stream_hash));
        }
        entries.sort_unstable_by(|a, b| b.cmp(a));
        entries.dedup();
        entries
    }

    /// Rewrite every entry pointing into `[chunk_start, chunk_end)` after
    /// that chunk was scavenged, and record its new scavenge version.
    pub fn relocate(
        &self,
        relocations: &RelocationMap,
        chunk_number: u32,
        chunk_version: u32,
        chunk_start: u64,
        chunk_end: u64,
    ) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let snapshot = self.snapshot();

        let memtable_entries = snapshot.memtable.entries();
        let memtable = if memtable_entries.iter().any(|e| relocations.contains_key(&e.position)) {
            Arc::new(MemTable::from_entries(
                self.config.memtable_max_entries,
                relocate_entries(memtable_entries, relocations),
                snapshot.memtable.applied_position(),
            ))
        } else {
            snapshot.memtable.clone()
        };

        let mut replaced = Vec::new();
        let mut tables = Vec::with_capacity(snapshot.tables.len());
        for table in &snapshot.tables {
            if !table_touches(table, chunk_start, chunk_end) {
                tables.push(table.clone());
                continue;
            }
            let id = manifest.allocate_table_id();
            let writer = PTableWriter::create(&self.dir, id, table.level())?;
            let info = rewrite_table(table, relocations, writer)?;
            tables.push(Arc::new(PTable::open(&self.dir, &info)?));
            replaced.push(table.info().clone());
            manifest.add_table(info);
        }

        let replaced_ids: Vec<u64> = replaced.iter().map(|t| t.id).collect();
        manifest.remove_tables(&replaced_ids);
        manifest.chunk_versions.insert(chunk_number, chunk_version);
        manifest.save(&self.dir)?;

        self.install(memtable, tables);
        drop(snapshot);
        self.remove_files(&replaced);

        debug!(
            chunk = chunk_number,
            version = chunk_version,
            rewritten_tables = replaced.len(),
            "Relocated index entries"
        );
        Ok(())
    }

    /// Drop every table and start over from log position zero.
    pub fn reset(&self, chunk_versions: BTreeMap<u32, u32>) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let old_tables = std::mem::take(&mut manifest.tables);
        let next_table_id = manifest.next_table_id;

        *manifest = IndexManifest {
            next_table_id,
            chunk_versions,
            ..IndexManifest::default()
        };
        manifest.save(&self.dir)?;

        self.install(Arc::new(MemTable::new(self.config.memtable_max_entries)), Vec::new());
        self.remove_files(&old_tables);
        warn!("Table index reset, it will be rebuilt from the log");
        Ok(())
    }

    /// Whether the index was built against the given chunk versions.
    pub fn matches_chunk_versions(&self, log_versions: &BTreeMap<u32, u32>) -> bool {
        let manifest = self.manifest.lock();
        let numbers: HashSet<u32> = manifest
            .chunk_versions
            .keys()
            .chain(log_versions.keys())
            .copied()
            .collect();
        numbers.into_iter().all(|n| {
            manifest.chunk_versions.get(&n).copied().unwrap_or(0) == log_versions.get(&n).copied().unwrap_or(0)
        })
    }

    pub fn chunk_versions(&self) -> BTreeMap<u32, u32> {
        self.manifest.lock().chunk_versions.clone()
    }

    pub fn set_chunk_versions(&self, versions: BTreeMap<u32, u32>) -> Result<()> {
        let mut manifest = self.manifest.lock();
        manifest.chunk_versions = versions;
        manifest.save(&self.dir)
    }

    /// Log position below which every index entry is on disk.
    pub fn persisted_position(&self) -> u64 {
        self.manifest.lock().persisted_position
    }

    /// Log position the in-memory index has been fed up to.
    pub fn applied_position(&self) -> u64 {
        self.snapshot().memtable.applied_position()
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        let manifest = self.manifest.lock();
        IndexStats {
            memtable_entries: snapshot.memtable.len(),
            table_count: snapshot.tables.len(),
            persisted_entries: snapshot.tables.iter().map(|t| t.len() as u64).sum(),
            levels: manifest.level_counts(),
            persisted_position: manifest.persisted_position,
        }
    }
}

fn sort_tables(tables: &mut [Arc<PTable>]) {
    tables.sort_by(|a, b| a.level().cmp(&b.level()).then(b.id().cmp(&a.id())));
}

/// Remove temp files and tables the manifest does not reference.
fn remove_stray_files(dir: &Path, manifest: &IndexManifest) -> Result<()> {
    let known: HashSet<&str> = manifest.tables.iter().map(|t| t.file_name.as_str()).collect();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name == MANIFEST_FILE || known.contains(name) {
            continue;
        }
        if name.ends_with(".tmp") || name.starts_with("ptable-") {
            warn!("Removing stray index file {:?}", path);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(max_entries: usize) -> IndexConfig {
        IndexConfig {
            memtable_max_entries: max_entries,
            max_tables_per_level: 2,
        }
    }

    #[test]
    fn test_lookups_span_memtable_and_tables() {
        let dir = TempDir::new().unwrap();
        let index = TableIndex::open(dir.path(), &config(2), Metrics::new()).unwrap();

        index
            .add(&[IndexEntry::new(1, 0, 10), IndexEntry::new(1, 1, 20)], 30)
            .unwrap();
        assert_eq!(index.stats().table_count, 1);
        assert_eq!(index.persisted_position(), 30);

        index.add(&[IndexEntry::new(1, 2, 40)], 50).unwrap();
        assert_eq!(index.get(1, 0), vec![10]);
        assert_eq!(index.get(1, 2), vec![40]);
        assert_eq!(index.range(1, 0, 2).len(), 3);
        assert_eq!(index.latest_candidates(1)[0], IndexEntry::new(1, 2, 40));
    }

    #[test]
    fn test_flush_and_merge_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = TableIndex::open(dir.path(), &config(1), Metrics::new()).unwrap();
            for n in 0..4 {
                index.add(&[IndexEntry::new(9, n, n as u64 * 100)], n as u64 * 100 + 50).unwrap();
            }
            let stats = index.stats();
            assert_eq!(stats.persisted_entries, 4);
            assert!(stats.levels.keys().any(|&level| level > 0));
        }

        let index = TableIndex::open(dir.path(), &config(1), Metrics::new()).unwrap();
        assert_eq!(index.persisted_position(), 350);
        assert_eq!(index.range(9, 0, 3).len(), 4);
    }

    #[test]
    fn test_flush_of_empty_memtable_persists_position() {
        let dir = TempDir::new().unwrap();
        let index = TableIndex::open(dir.path(), &config(10), Metrics::new()).unwrap();
        index.add(&[], 4096).unwrap();
        index.flush().unwrap();
        assert_eq!(index.persisted_position(), 4096);
        assert_eq!(index.stats().table_count, 0);
    }

    #[test]
    fn test_relocate_rewrites_positions() {
        let dir = TempDir::new().unwrap();
        let index = TableIndex::open(dir.path(), &config(2), Metrics::new()).unwrap();
        index
            .add(&[IndexEntry::new(1, 0, 100), IndexEntry::new(2, 0, 200)], 300)
            .unwrap();
        index.add(&[IndexEntry::new(3, 0, 5000)], 5100).unwrap();

        let mut relocations = RelocationMap::new();
        relocations.insert(100, None);
        relocations.insert(200, Some(64));
        index.relocate(&relocations, 0, 1, 0, 4096).unwrap();

        assert!(index.get(1, 0).is_empty());
        assert_eq!(index.get(2, 0), vec![64]);
        assert_eq!(index.get(3, 0), vec![5000]);
        assert_eq!(index.chunk_versions().get(&0), Some(&1));

        let mut log_versions = BTreeMap::new();
        log_versions.insert(0, 1);
        log_versions.insert(1, 0);
        assert!(index.matches_chunk_versions(&log_versions));
        log_versions.insert(1, 2);
        assert!(!index.matches_chunk_versions(&log_versions));
    }

    #[test]
    fn test_stray_files_removed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ptable-0000000099.idx"), b"junk").unwrap();
        std::fs::write(dir.path().join("ptable-0000000098.idx.tmp"), b"junk").unwrap();
        let _index = TableIndex::open(dir.path(), &config(10), Metrics::new()).unwrap();
        assert!(!dir.path().join("ptable-0000000099.idx").exists());
        assert!(!dir.path().join("ptable-0000000098.idx.tmp").exists());
    }

    #[test]
    fn test_reset_clears_tables() {
        let dir = TempDir::new().unwrap();
        let index = TableIndex::open(dir.path(), &config(1), Metrics::new()).unwrap();
        index.add(&[IndexEntry::new(1, 0, 10)], 20).unwrap();
        index.reset(BTreeMap::new()).unwrap();
        assert!(index.get(1, 0).is_empty());
        assert_eq!(index.persisted_position(), 0);
    }
}
