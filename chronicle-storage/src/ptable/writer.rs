//! PTable writer

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use chronicle_core::error::{Error, Result};

use super::types::*;
use crate::memtable::IndexEntry;

/// Streams sorted entries into a new PTable file.
///
/// Output goes to a `.tmp` file that is renamed into place by
/// [`PTableWriter::finish`], so a crash never leaves a half-written table
/// under its final name.
pub struct PTableWriter {
    id: u64,
    level: u32,
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,
    entry_count: u64,
    last: Option<IndexEntry>,
}

impl PTableWriter {
    pub fn create(dir: &Path, id: u64, level: u32) -> Result<Self> {
        let file_name = ptable_file_name(id);
        let final_path = dir.join(&file_name);
        let temp_path = dir.join(format!("{}.tmp", file_name));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .map_err(|e| Error::PTable {
                message: format!("Failed to create PTable {:?}", temp_path),
                source: Some(Box::new(e)),
            })?;

        let mut writer = BufWriter::with_capacity(256 * 1024, file);
        writer.write_all(&[0u8; PTABLE_HEADER_SIZE])?; // Header placeholder

        Ok(Self {
            id,
            level,
            temp_path,
            final_path,
            writer,
            hasher: crc32fast::Hasher::new(),
            entry_count: 0,
            last: None,
        })
    }

    /// Append an entry. Entries must arrive in ascending order; an exact
    /// repeat of the previous entry is dropped.
    pub fn add(&mut self, entry: IndexEntry) -> Result<()> {
        if let Some(last) = self.last {
            if entry == last {
                return Ok(());
            }
            if entry < last {
                return Err(Error::PTable {
                    message: format!("entries out of order: {:?} after {:?}", entry, last),
                    source: None,
                });
            }
        }

        let mut buf = [0u8; PTABLE_ENTRY_SIZE];
        encode_entry(&entry, &mut buf);
        self.writer.write_all(&buf)?;
        self.hasher.update(&buf);
        self.entry_count += 1;
        self.last = Some(entry);
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write the header, fsync and move the table to its final name.
    pub fn finish(mut self) -> Result<PTableInfo> {
        self.writer.flush()?;
        let checksum = self.hasher.clone().finalize();

        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(PTABLE_MAGIC)?;
        file.write_u32::<LittleEndian>(PTABLE_VERSION)?;
        file.write_u32::<LittleEndian>(self.level)?;
        file.write_u64::<LittleEndian>(self.entry_count)?;
        file.write_u32::<LittleEndian>(checksum)?;
        file.write_u32::<LittleEndian>(0)?; // Reserved
        file.sync_all()?;

        std::fs::rename(&self.temp_path, &self.final_path).map_err(|e| Error::PTable {
            message: format!("Failed to publish PTable {:?}", self.final_path),
            source: Some(Box::new(e)),
        })?;

        Ok(PTableInfo {
            id: self.id,
            level: self.level,
            file_name: ptable_file_name(self.id),
            entry_count: self.entry_count,
        })
    }
}

/// Write `entries` (sorted) as a complete PTable.
pub fn write_ptable(
    dir: &Path,
    id: u64,
    level: u32,
    entries: impl IntoIterator<Item = IndexEntry>,
) -> Result<PTableInfo> {
    let mut writer = PTableWriter::create(dir, id, level)?;
    for entry in entries {
        writer.add(entry)?;
    }
    writer.finish()
}
