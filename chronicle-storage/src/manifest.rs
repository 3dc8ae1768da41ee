//! # Index Manifest
//!
//! Lists the PTables that make up the persisted index, the log position the
//! index has been persisted up to, and the scavenge version of every chunk
//! the index was built against. Saved as JSON via write-to-temp + rename.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use chronicle_core::error::{Error, Result};

use crate::ptable::PTableInfo;

pub const MANIFEST_FILE: &str = "indexmap.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    pub next_table_id: u64,
    /// All log records before this position are in the tables below.
    pub persisted_position: u64,
    pub tables: Vec<PTableInfo>,
    #[serde(default)]
    pub chunk_versions: BTreeMap<u32, u32>,
}

impl Default for IndexManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            next_table_id: 1,
            persisted_position: 0,
            tables: Vec::new(),
            chunk_versions: BTreeMap::new(),
        }
    }
}

impl IndexManifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        if !path.exists() {
            info!("Creating new index manifest in {:?}", dir);
            let manifest = Self::default();
            manifest.save(dir)?;
            return Ok(manifest);
        }

        let bytes = std::fs::read(&path)?;
        let manifest: Self = serde_json::from_slice(&bytes).map_err(|e| Error::IndexManifest {
            message: format!("Failed to parse {:?}", path),
            source: Some(Box::new(e)),
        })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::IndexManifest {
                message: format!("unsupported manifest version {}", manifest.version),
                source: None,
            });
        }
        Ok(manifest)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let temp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| Error::IndexManifest {
            message: "Failed to serialize manifest".to_string(),
            source: Some(Box::new(e)),
        })?;

        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp, &path)?;
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    pub fn add_table(&mut self, table: PTableInfo) {
        self.tables.push(table);
    }

    pub fn remove_tables(&mut self, ids: &[u64]) {
        self.tables.retain(|t| !ids.contains(&t.id));
    }

    pub fn level_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for table in &self.tables {
            *counts.entry(table.level).or_insert(0) += 1;
        }
        counts
    }
}
