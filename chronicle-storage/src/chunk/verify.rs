//! Offline, read-only check of a chunk directory.
//!
//! Unlike [`ChunkLog::open`](super::ChunkLog::open) nothing is repaired:
//! torn tails are measured, leftover scavenge output is listed, and no file
//! is created, truncated or removed.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use chronicle_core::{
    config::DbConfig,
    error::{Error, Result},
};

use super::file::{scan_tail, SealedChunk};
use super::record::{decode_frame, DecodeOutcome};
use super::types::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub chunk_number: u32,
    pub completed: bool,
    pub records: u64,
    /// Data bytes holding valid records.
    pub data_size: u64,
    /// Bytes after the last valid record of an unsealed chunk.
    pub torn_bytes: u64,
    pub scavenge_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub chunks: Vec<ChunkReport>,
    /// Position right after the last valid record.
    pub end_position: u64,
    pub stale_scavenge_files: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn records(&self) -> u64 {
        self.chunks.iter().map(|c| c.records).sum()
    }

    pub fn torn_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.torn_bytes).sum()
    }
}

/// Chunk numbers and unfinished scavenge outputs found in `dir`.
pub(crate) fn scan_dir(dir: &Path) -> Result<(Vec<u32>, Vec<PathBuf>)> {
    let mut numbers = Vec::new();
    let mut stale = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name.starts_with("chunk-") && name.ends_with(SCAVENGE_TEMP_EXTENSION) {
            stale.push(path);
            continue;
        }
        if let Some(number) = parse_chunk_file_name(name) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    stale.sort();
    Ok((numbers, stale))
}

/// Chunks must be numbered 0..n without gaps.
pub(crate) fn check_contiguous(numbers: &[u32]) -> Result<()> {
    for (expected, &number) in numbers.iter().enumerate() {
        if number != expected as u32 {
            return Err(Error::corrupted(expected as u32, 0, "chunk file is missing"));
        }
    }
    Ok(())
}

/// Check every chunk in `config.path`: headers, footers, whole-chunk
/// checksums and the checksum of every record.
pub fn verify_chunks(config: &DbConfig) -> Result<VerifyReport> {
    let dir = &config.path;
    let (numbers, stale_scavenge_files) = scan_dir(dir)?;
    check_contiguous(&numbers)?;

    let mut report = VerifyReport {
        stale_scavenge_files,
        ..VerifyReport::default()
    };
    for (i, &number) in numbers.iter().enumerate() {
        let path = dir.join(chunk_file_name(number));
        let last = i + 1 == numbers.len();
        let chunk = if last && !has_footer(&path)? {
            verify_unsealed(&path, number, config.chunk_size)?
        } else {
            verify_sealed(&SealedChunk::open(&path, number, true)?, config.chunk_size)?
        };
        report.end_position = number as u64 * config.chunk_size + chunk.data_size;
        report.chunks.push(chunk);
    }

    info!(
        chunks = report.chunks.len(),
        records = report.records(),
        torn_bytes = report.torn_bytes(),
        "Verified chunks"
    );
    Ok(report)
}

/// Whether the file ends in a completed-chunk footer that matches its length.
fn has_footer(path: &Path) -> Result<bool> {
    let data = std::fs::read(path)?;
    if data.len() < CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
        return Ok(false);
    }
    Ok(match ChunkFooter::parse(&data[data.len() - CHUNK_FOOTER_SIZE..]) {
        Some(footer) => {
            footer.completed
                && CHUNK_HEADER_SIZE as u64 + footer.logical_size + CHUNK_FOOTER_SIZE as u64 == data.len() as u64
        }
        None => false,
    })
}

fn verify_sealed(chunk: &SealedChunk, chunk_size: u64) -> Result<ChunkReport> {
    let number = chunk.header.chunk_number;
    check_size(number, chunk.header.chunk_size, chunk_size)?;

    let data = chunk.data();
    let mut offset = 0usize;
    let mut records = 0u64;
    while offset < data.len() {
        match decode_frame(&data[offset..], chunk_size as usize, true) {
            DecodeOutcome::Complete { consumed, .. } => {
                offset += consumed;
                records += 1;
            }
            DecodeOutcome::Incomplete => {
                return Err(Error::corrupted(number, offset as u64, "record overruns the end of a completed chunk"))
            }
            DecodeOutcome::Corrupt(reason) => return Err(Error::corrupted(number, offset as u64, reason)),
        }
    }
    if records != chunk.footer.record_count {
        return Err(Error::corrupted(
            number,
            0,
            format!("footer counts {} records, found {}", chunk.footer.record_count, records),
        ));
    }

    Ok(ChunkReport {
        chunk_number: number,
        completed: true,
        records,
        data_size: data.len() as u64,
        torn_bytes: 0,
        scavenge_version: chunk.header.scavenge_version,
    })
}

fn verify_unsealed(path: &Path, number: u32, chunk_size: u64) -> Result<ChunkReport> {
    let data = std::fs::read(path)?;
    if data.len() < CHUNK_HEADER_SIZE {
        return Ok(ChunkReport {
            chunk_number: number,
            completed: false,
            records: 0,
            data_size: 0,
            torn_bytes: data.len() as u64,
            scavenge_version: 0,
        });
    }

    let header = ChunkHeader::read_from(&data[..CHUNK_HEADER_SIZE], number)?;
    check_size(number, header.chunk_size, chunk_size)?;
    let body = &data[CHUNK_HEADER_SIZE..];
    let scan = scan_tail(body, number, chunk_size, &mut crc32fast::Hasher::new());

    Ok(ChunkReport {
        chunk_number: number,
        completed: false,
        records: scan.record_count,
        data_size: scan.valid_len as u64,
        torn_bytes: (body.len() - scan.valid_len) as u64,
        scavenge_version: header.scavenge_version,
    })
}

fn check_size(number: u32, written: u64, configured: u64) -> Result<()> {
    if written != configured {
        return Err(Error::Configuration {
            message: format!(
                "chunk #{} was written with chunk size {}, configured {}",
                number, written, configured
            ),
        });
    }
    Ok(())
}
