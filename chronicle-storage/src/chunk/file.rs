use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{info, warn};

use chronicle_core::{
    error::{Error, Result},
    LogRecord,
};

use super::record::{decode_frame, peek_payload_len, DecodeOutcome};
use super::types::*;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// The chunk currently receiving appends, or a scavenge output being built.
pub(crate) struct ActiveChunk {
    pub header: ChunkHeader,
    pub path: PathBuf,
    writer: BufWriter<File>,
    pub data_size: u64,
    pub record_count: u64,
    hasher: crc32fast::Hasher,
    sealed: bool,
}

impl ActiveChunk {
    pub fn create(path: &Path, header: ChunkHeader) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(path)?;

        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let header_bytes = header.to_bytes()?;
        writer.write_all(&header_bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);

        Ok(ActiveChunk {
            header,
            path: path.to_path_buf(),
            writer,
            data_size: 0,
            record_count: 0,
            hasher,
            sealed: false,
        })
    }

    pub fn number(&self) -> u32 {
        self.header.chunk_number
    }

    /// Logical position of the next append.
    pub fn position(&self) -> u64 {
        self.header.chunk_number as u64 * self.header.chunk_size + self.data_size
    }

    pub fn remaining(&self) -> u64 {
        self.header.chunk_size - self.data_size
    }

    pub fn append(&mut self, frame: &[u8]) -> Result<()> {
        debug_assert!(!self.sealed);
        debug_assert!(frame.len() as u64 <= self.remaining());
        self.writer.write_all(frame)?;
        self.hasher.update(frame);
        self.data_size += frame.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    pub fn flush(&mut self, sync: bool) -> Result<()> {
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drop buffered bytes without writing them.
    pub fn discard_buffered(&mut self) -> Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let previous = std::mem::replace(&mut self.writer, BufWriter::with_capacity(WRITE_BUFFER_SIZE, file));
        let (_file, _unwritten) = previous.into_parts();
        Ok(())
    }

    /// Write the footer and fsync. Sealing twice is a no-op.
    pub fn seal(&mut self) -> Result<ChunkFooter> {
        let footer = ChunkFooter {
            record_count: self.record_count,
            logical_size: self.data_size,
            completed: true,
            checksum: self.hasher.clone().finalize(),
        };
        if self.sealed {
            return Ok(footer);
        }

        footer.write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.sealed = true;
        Ok(footer)
    }

    /// Separate read handle for the reader side.
    pub fn open_reader(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }
}

/// A completed chunk, memory mapped read-only.
pub(crate) struct SealedChunk {
    pub header: ChunkHeader,
    pub footer: ChunkFooter,
    pub path: PathBuf,
    mmap: Mmap,
}

impl SealedChunk {
    pub fn open(path: &Path, chunk_number: u32, verify_hash: bool) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
            return Err(Error::corrupted(chunk_number, 0, "file too small for a completed chunk"));
        }

        let mmap = unsafe { Mmap::map(&file)? };
        let header = ChunkHeader::read_from(&mmap[..CHUNK_HEADER_SIZE], chunk_number)?;
        let footer = ChunkFooter::parse(&mmap[len - CHUNK_FOOTER_SIZE..])
            .filter(|f| f.completed)
            .ok_or_else(|| Error::corrupted(chunk_number, 0, "chunk is not completed"))?;

        let expected_len = CHUNK_HEADER_SIZE as u64 + footer.logical_size + CHUNK_FOOTER_SIZE as u64;
        if expected_len != len as u64 || footer.logical_size > header.chunk_size {
            return Err(Error::corrupted(
                chunk_number,
                footer.logical_size,
                format!("footer logical size {} does not match file length {}", footer.logical_size, len),
            ));
        }

        let chunk = SealedChunk {
            header,
            footer,
            path: path.to_path_buf(),
            mmap,
        };
        if verify_hash {
            chunk.verify_checksum()?;
        }
        Ok(chunk)
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let end = CHUNK_HEADER_SIZE + self.footer.logical_size as usize;
        if crc32fast::hash(&self.mmap[..end]) != self.footer.checksum {
            return Err(Error::corrupted(
                self.header.chunk_number,
                0,
                "whole-chunk checksum mismatch",
            ));
        }
        Ok(())
    }

    /// Data area, header and footer excluded.
    pub fn data(&self) -> &[u8] {
        &self.mmap[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + self.footer.logical_size as usize]
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Read the record at `offset` in the data area; `None` at the end.
    pub fn read_record(&self, offset: u64, verify: bool) -> Result<Option<(LogRecord, usize)>> {
        let data = self.data();
        let offset_usize = offset as usize;
        if offset_usize >= data.len() {
            return Ok(None);
        }
        match decode_frame(&data[offset_usize..], self.header.chunk_size as usize, verify) {
            DecodeOutcome::Complete { record, consumed } => Ok(Some((record, consumed))),
            DecodeOutcome::Incomplete => Err(Error::corrupted(
                self.header.chunk_number,
                offset,
                "record overruns the end of a completed chunk",
            )),
            DecodeOutcome::Corrupt(reason) => Err(Error::corrupted(self.header.chunk_number, offset, reason)),
        }
    }
}

/// Read the record at `offset` of an active chunk through positional reads.
///
/// Returns `None` when the bytes are not (yet) in the file.
pub(crate) fn read_active_record(
    file: &File,
    header: &ChunkHeader,
    offset: u64,
    verify: bool,
) -> Result<Option<(LogRecord, usize)>> {
    let file_offset = CHUNK_HEADER_SIZE as u64 + offset;
    let mut prefix = [0u8; RECORD_PREFIX_SIZE];
    match file.read_exact_at(&mut prefix, file_offset) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let payload_len = peek_payload_len(&prefix).unwrap_or(0);
    if payload_len as u64 + RECORD_OVERHEAD as u64 > header.chunk_size - offset.min(header.chunk_size) {
        return Err(Error::corrupted(
            header.chunk_number,
            offset,
            format!("record length {} overruns chunk", payload_len),
        ));
    }

    let mut frame = vec![0u8; payload_len + RECORD_OVERHEAD];
    match file.read_exact_at(&mut frame, file_offset) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    match decode_frame(&frame, header.chunk_size as usize, verify) {
        DecodeOutcome::Complete { record, consumed } => Ok(Some((record, consumed))),
        DecodeOutcome::Incomplete => Ok(None),
        DecodeOutcome::Corrupt(reason) => Err(Error::corrupted(header.chunk_number, offset, reason)),
    }
}

/// Valid prefix of an unsealed chunk's data area.
pub(crate) struct TailScan {
    pub valid_len: usize,
    pub record_count: u64,
}

/// Walk the records of an unsealed data area up to the first one that is
/// incomplete or fails its checksum. Touches nothing on disk.
pub(crate) fn scan_tail(body: &[u8], chunk_number: u32, chunk_size: u64, hasher: &mut crc32fast::Hasher) -> TailScan {
    let mut offset = 0usize;
    let mut record_count = 0u64;
    loop {
        match decode_frame(&body[offset..], chunk_size as usize, true) {
            DecodeOutcome::Complete { consumed, .. } => {
                hasher.update(&body[offset..offset + consumed]);
                offset += consumed;
                record_count += 1;
            }
            DecodeOutcome::Incomplete => break,
            DecodeOutcome::Corrupt(reason) => {
                warn!(chunk = chunk_number, offset, %reason, "Invalid record in chunk tail");
                break;
            }
        }
    }
    TailScan { valid_len: offset, record_count }
}

/// Outcome of opening the last chunk of the log.
pub(crate) enum RecoveredChunk {
    /// Still receiving appends; `truncated` bytes of torn tail were cut off.
    Active { chunk: ActiveChunk, truncated: u64 },
    /// Fully sealed; a new chunk must follow.
    Sealed(SealedChunk),
}

/// Open the last chunk, scanning it record by record and cutting off any
/// trailing bytes that do not form a valid record.
pub(crate) fn recover_last_chunk(path: &Path, chunk_number: u32, chunk_size: u64) -> Result<RecoveredChunk> {
    info!("Recovering chunk #{} from {:?}", chunk_number, path);

    let data = std::fs::read(path)?;
    if data.len() < CHUNK_HEADER_SIZE {
        warn!(
            chunk = chunk_number,
            len = data.len(),
            "Chunk header is torn, recreating empty chunk"
        );
        let header = ChunkHeader {
            chunk_number,
            chunk_size,
            created_at: chronicle_core::utils::now_millis(),
            scavenge_version: 0,
        };
        let chunk = ActiveChunk::create(path, header)?;
        return Ok(RecoveredChunk::Active { chunk, truncated: data.len() as u64 });
    }

    let header = ChunkHeader::read_from(&data[..CHUNK_HEADER_SIZE], chunk_number)?;
    if header.chunk_size != chunk_size {
        return Err(Error::Configuration {
            message: format!(
                "chunk #{} was written with chunk size {}, configured {}",
                chunk_number, header.chunk_size, chunk_size
            ),
        });
    }

    if data.len() >= CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
        let footer_bytes = &data[data.len() - CHUNK_FOOTER_SIZE..];
        if let Some(footer) = ChunkFooter::parse(footer_bytes) {
            let sealed_len = CHUNK_HEADER_SIZE as u64 + footer.logical_size + CHUNK_FOOTER_SIZE as u64;
            if footer.completed && sealed_len == data.len() as u64 {
                drop(data);
                return Ok(RecoveredChunk::Sealed(SealedChunk::open(path, chunk_number, false)?));
            }
        }
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..CHUNK_HEADER_SIZE]);
    let TailScan { valid_len: offset, record_count } =
        scan_tail(&data[CHUNK_HEADER_SIZE..], chunk_number, chunk_size, &mut hasher);

    let valid_len = (CHUNK_HEADER_SIZE + offset) as u64;
    let truncated = data.len() as u64 - valid_len;
    drop(data);

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    if truncated > 0 {
        warn!(
            chunk = chunk_number,
            truncated_bytes = truncated,
            valid_records = record_count,
            "Truncating torn tail of chunk at data offset {}",
            offset
        );
        file.set_len(valid_len)?;
        file.sync_all()?;
    }

    let mut file = file;
    file.seek(SeekFrom::Start(valid_len))?;

    Ok(RecoveredChunk::Active {
        chunk: ActiveChunk {
            header,
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            data_size: offset as u64,
            record_count,
            hasher,
            sealed: false,
        },
        truncated,
    })
}
