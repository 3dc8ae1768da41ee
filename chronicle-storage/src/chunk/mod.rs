//! Chunked, append-only transaction log.
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Logical log address space                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  chunk #0            chunk #1            chunk #2 (active)      │
//! │  [0, S)              [S, 2S)             [2S, 3S)               │
//! │  sealed, mmap        sealed, mmap        appends + pread        │
//! │                                                                 │
//! │  position = chunk_number * chunk_size + data offset             │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! Chunk File Layout
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (64 bytes)                                          │
//! │    Magic "CHRNCHNK" (8) | Version (4) | Chunk Number (4)    │
//! │    Chunk Size (8) | Created At (8) | Scavenge Version (4)   │
//! │    Reserved (28)                                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Record 1..N                                                │
//! │    Length (4) | Type (1) | Payload (Length) | CRC32 (4)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (40 bytes, only once sealed)                        │
//! │    Record Count (8) | Logical Size (8) | Flags (4)          │
//! │    Chunk CRC32 (4) | Reserved (8) | Magic "CHRNSEAL" (8)    │
//! └─────────────────────────────────────────────────────────────┘
//!
//! A record never spans two chunks: when it does not fit in the active
//! chunk, that chunk is sealed and the record goes to the start of the next
//! one. Only the last chunk may be unsealed; on open its torn tail is cut
//! off at the last record that decodes and checksums correctly.

mod file;
mod iterator;
mod record;
mod types;
mod verify;

pub use iterator::{LogEntry, SequentialReader};
pub use record::frame_len;
pub use types::{ChunkInfo, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE, RECORD_OVERHEAD};
pub use verify::{verify_chunks, ChunkReport, VerifyReport};

pub(crate) use file::ActiveChunk;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use chronicle_core::{
    config::DbConfig,
    error::{Error, Result},
    metrics::Metrics,
    utils::now_millis,
    LogRecord, PrepareRecord,
};

use file::{read_active_record, recover_last_chunk, RecoveredChunk, SealedChunk};
pub(crate) use record::encode_frame;
use types::{chunk_file_name, ChunkHeader, SCAVENGE_TEMP_EXTENSION};
use verify::{check_contiguous, scan_dir};

/// What lies at a given position.
pub(crate) enum NextRecord {
    Record { record: LogRecord, len: usize },
    /// End of a completed chunk; reading continues in the next one.
    ChunkEnd { next_chunk_start: u64 },
    /// Nothing written here yet.
    End,
}

/// End of the log at some instant, for [`ChunkLog::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMark {
    chunk_number: u32,
    data_size: u64,
}

impl LogMark {
    pub fn chunk_number(&self) -> u32 {
        self.chunk_number
    }
}

struct ChunkHandle {
    number: u32,
    data: RwLock<ChunkData>,
}

enum ChunkData {
    Active { file: File, header: ChunkHeader },
    Sealed(SealedChunk),
}

impl ChunkHandle {
    fn new(number: u32, data: ChunkData) -> Arc<Self> {
        Arc::new(Self { number, data: RwLock::new(data) })
    }
}

pub struct ChunkLog {
    dir: PathBuf,
    config: DbConfig,
    chunks: RwLock<Vec<Arc<ChunkHandle>>>,
    active: Mutex<ActiveChunk>,
    /// Set after a failed write; the tail of the active chunk is unknown.
    poisoned: AtomicBool,
    /// Bumped on every chunk replacement.
    generation: AtomicU64,
    metrics: Metrics,
}

impl ChunkLog {
    /// Open or create the log in `config.path`, recovering the last chunk.
    pub fn open(config: &DbConfig, metrics: Metrics) -> Result<Self> {
        let dir = config.path.clone();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Io {
            message: format!("Failed to create db directory: {:?}", dir),
            source: e,
        })?;

        let numbers = Self::list_chunks(&dir)?;
        let mut handles = Vec::with_capacity(numbers.len() + 1);

        let active = match numbers.split_last() {
            None => {
                info!("Creating new transaction log in {:?}", dir);
                create_chunk(&dir, 0, config.chunk_size, 0)?
            }
            Some((&last, completed)) => {
                for &number in completed {
                    let sealed = SealedChunk::open(&dir.join(chunk_file_name(number)), number, config.verify_hashes)?;
                    check_chunk_size(&sealed.header, config.chunk_size)?;
                    handles.push(ChunkHandle::new(number, ChunkData::Sealed(sealed)));
                }

                match recover_last_chunk(&dir.join(chunk_file_name(last)), last, config.chunk_size)? {
                    RecoveredChunk::Active { chunk, truncated } => {
                        if truncated > 0 {
                            warn!(
                                chunk = last,
                                truncated_bytes = truncated,
                                "Discarded torn records at the end of the log"
                            );
                        }
                        chunk
                    }
                    RecoveredChunk::Sealed(sealed) => {
                        if config.verify_hashes {
                            sealed.verify_checksum()?;
                        }
                        handles.push(ChunkHandle::new(last, ChunkData::Sealed(sealed)));
                        create_chunk(&dir, last + 1, config.chunk_size, 0)?
                    }
                }
            }
        };

        handles.push(ChunkHandle::new(
            active.number(),
            ChunkData::Active { file: active.open_reader()?, header: active.header },
        ));

        info!(
            chunks = handles.len(),
            writer_position = active.position(),
            "Transaction log opened"
        );

        Ok(Self {
            dir,
            config: config.clone(),
            chunks: RwLock::new(handles),
            active: Mutex::new(active),
            poisoned: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            metrics,
        })
    }

    fn list_chunks(dir: &Path) -> Result<Vec<u32>> {
        let (numbers, stale) = scan_dir(dir)?;
        for path in stale {
            warn!("Removing unfinished scavenge output {:?}", path);
            std::fs::remove_file(&path)?;
        }
        check_contiguous(&numbers)?;
        Ok(numbers)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    /// Position the next append will land at, modulo rollover.
    pub fn writer_position(&self) -> u64 {
        self.active.lock().position()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Make room for a batch of `batch_len` bytes whose first record is
    /// `first_len` bytes, and return where that first record will land.
    ///
    /// The active chunk is completed early when the whole batch would fit in
    /// a fresh chunk but not in the remaining space.
    pub fn reserve(&self, batch_len: usize, first_len: usize) -> Result<u64> {
        let mut active = self.active.lock();
        self.check_writable()?;
        self.check_record_len(first_len)?;

        let remaining = active.remaining();
        let batch_len = batch_len as u64;
        let must_roll = batch_len > remaining
            && active.data_size > 0
            && (batch_len <= self.config.chunk_size || first_len as u64 > remaining);
        if must_roll {
            self.roll_over(&mut active)
                .map_err(|e| self.fail("chunk rollover failed", e))?;
        }
        Ok(active.position())
    }

    /// Append one record, returning its position.
    pub fn append(&self, record: &LogRecord) -> Result<u64> {
        let frame = encode_frame(record)?;
        let mut active = self.active.lock();
        self.check_writable()?;
        self.check_record_len(frame.len())?;

        if frame.len() as u64 > active.remaining() {
            self.roll_over(&mut active)
                .map_err(|e| self.fail("chunk rollover failed", e))?;
        }

        let position = active.position();
        active
            .append(&frame)
            .map_err(|e| self.fail("append failed", e))?;
        Ok(position)
    }

    /// Flush appended records (fsync when configured) and return the
    /// position right after the last one.
    pub fn flush(&self) -> Result<u64> {
        let mut active = self.active.lock();
        self.check_writable()?;
        active
            .flush(self.config.sync_on_write)
            .map_err(|e| self.fail("flush failed", e))?;
        Ok(active.position())
    }

    /// Seal the active chunk if it holds any data. Returns whether it did.
    pub fn complete_chunk(&self) -> Result<bool> {
        let mut active = self.active.lock();
        self.check_writable()?;
        if active.data_size == 0 {
            return Ok(false);
        }
        self.roll_over(&mut active)
            .map_err(|e| self.fail("chunk rollover failed", e))?;
        Ok(true)
    }

    /// Current end of the log, unflushed appends included.
    pub fn mark(&self) -> LogMark {
        let active = self.active.lock();
        LogMark {
            chunk_number: active.number(),
            data_size: active.data_size,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Discard everything appended after `mark`, flushed or not.
    ///
    /// Chunks created since are deleted and a chunk sealed since is reopened
    /// for appends. Nothing past `mark` may have been published through the
    /// writer checkpoint. Works on a poisoned log and leaves it poisoned; a
    /// failed rollback poisons it.
    pub fn rollback(&self, mark: LogMark) -> Result<()> {
        let mut active = self.active.lock();
        if active.number() == mark.chunk_number && active.data_size == mark.data_size {
            return Ok(());
        }
        if active.number() < mark.chunk_number
            || (active.number() == mark.chunk_number && active.data_size < mark.data_size)
        {
            return Err(Error::Internal {
                message: format!(
                    "rollback target chunk #{} offset {} is past the end of the log",
                    mark.chunk_number, mark.data_size
                ),
            });
        }

        self.rollback_locked(&mut active, mark)
            .map_err(|e| self.fail("rollback failed", e))?;
        warn!(
            chunk = mark.chunk_number,
            offset = mark.data_size,
            "Rolled back unpublished appends"
        );
        Ok(())
    }

    fn rollback_locked(&self, active: &mut ActiveChunk, mark: LogMark) -> Result<()> {
        active.discard_buffered()?;

        let mut chunks = self.chunks.write();
        while chunks.len() > mark.chunk_number as usize + 1 {
            if let Some(handle) = chunks.pop() {
                let path = self.dir.join(chunk_file_name(handle.number));
                debug!(chunk = handle.number, "Removing chunk created after rollback point");
                std::fs::remove_file(&path)?;
            }
        }
        let handle = chunks
            .get(mark.chunk_number as usize)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("chunk #{} is not open", mark.chunk_number),
            })?;
        drop(chunks);

        let path = self.dir.join(chunk_file_name(mark.chunk_number));
        let mut data = handle.data.write();
        {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(CHUNK_HEADER_SIZE as u64 + mark.data_size)?;
            file.sync_all()?;
        }
        File::open(&self.dir)?.sync_all()?;

        let chunk = match recover_last_chunk(&path, mark.chunk_number, self.config.chunk_size)? {
            RecoveredChunk::Active { chunk, .. } => chunk,
            RecoveredChunk::Sealed(_) => {
                return Err(Error::Internal {
                    message: format!("chunk #{} still sealed after rollback", mark.chunk_number),
                })
            }
        };
        if chunk.data_size != mark.data_size {
            return Err(Error::corrupted(
                mark.chunk_number,
                chunk.data_size,
                format!("rollback point {} is not a record boundary", mark.data_size),
            ));
        }

        *data = ChunkData::Active {
            file: chunk.open_reader()?,
            header: chunk.header,
        };
        *active = chunk;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::WriteError {
                message: "log is read-only after a failed write, restart to recover".to_string(),
                source: None,
            });
        }
        Ok(())
    }

    /// Reject a record frame of `len` bytes that no chunk could hold.
    pub fn check_record_len(&self, len: usize) -> Result<()> {
        if len as u64 > self.config.chunk_size {
            return Err(Error::WriteError {
                message: format!(
                    "record of {} bytes does not fit in a chunk of {} bytes",
                    len, self.config.chunk_size
                ),
                source: None,
            });
        }
        Ok(())
    }

    fn fail(&self, context: &str, err: Error) -> Error {
        self.poisoned.store(true, Ordering::Release);
        self.metrics.record_write_error();
        match err {
            Error::Io { source, .. } => Error::write(context, source),
            other => other,
        }
    }

    fn roll_over(&self, active: &mut ActiveChunk) -> Result<()> {
        let footer = active.seal()?;
        let number = active.number();

        let next = create_chunk(&self.dir, number + 1, self.config.chunk_size, 0)?;
        let reader = next.open_reader()?;
        let next_header = next.header;
        let sealed = SealedChunk::open(&active.path, number, false)?;
        drop(std::mem::replace(active, next));

        if let Some(handle) = self.chunk(number) {
            *handle.data.write() = ChunkData::Sealed(sealed);
        }
        self.chunks
            .write()
            .push(ChunkHandle::new(number + 1, ChunkData::Active { file: reader, header: next_header }));

        self.metrics.record_chunk_completed();
        info!(
            chunk = number,
            records = footer.record_count,
            logical_size = footer.logical_size,
            "Completed chunk"
        );
        Ok(())
    }

    fn chunk(&self, number: u32) -> Option<Arc<ChunkHandle>> {
        self.chunks.read().get(number as usize).cloned()
    }

    pub(crate) fn read_next(&self, position: u64) -> Result<NextRecord> {
        let chunk_size = self.config.chunk_size;
        let number = (position / chunk_size) as u32;
        let offset = position % chunk_size;
        let handle = match self.chunk(number) {
            Some(handle) => handle,
            None => return Ok(NextRecord::End),
        };

        let verify = self.config.verify_checksums_on_read;
        let data = handle.data.read();
        let next = match &*data {
            ChunkData::Sealed(chunk) => match chunk.read_record(offset, verify)? {
                Some((record, len)) => NextRecord::Record { record, len },
                None => NextRecord::ChunkEnd {
                    next_chunk_start: (number as u64 + 1) * chunk_size,
                },
            },
            ChunkData::Active { file, header } => match read_active_record(file, header, offset, verify)? {
                Some((record, len)) => NextRecord::Record { record, len },
                None => NextRecord::End,
            },
        };
        Ok(next)
    }

    /// Read the record that starts exactly at `position`.
    pub fn read_at(&self, position: u64) -> Result<LogRecord> {
        match self.read_next(position)? {
            NextRecord::Record { record, .. } => Ok(record),
            NextRecord::ChunkEnd { .. } | NextRecord::End => Err(Error::NotFound { position }),
        }
    }

    /// Scan records from `position` (a record boundary) up to `limit`.
    pub fn read_sequential_from(&self, position: u64, limit: u64) -> SequentialReader<'_> {
        SequentialReader::new(self, position, limit)
    }

    /// Prepares of the transaction starting at `transaction_position`, in log
    /// order, looking no further than `commit_position`.
    pub fn read_transaction(
        &self,
        transaction_position: u64,
        commit_position: u64,
        event_count: u32,
    ) -> Result<Vec<(u64, PrepareRecord)>> {
        let mut prepares = Vec::with_capacity(event_count as usize);
        if event_count == 0 {
            return Ok(prepares);
        }

        for entry in self.read_sequential_from(transaction_position, commit_position) {
            let entry = entry?;
            if let LogRecord::Prepare(prepare) = entry.record {
                if prepare.transaction_position == transaction_position {
                    prepares.push((entry.position, prepare));
                    if prepares.len() == event_count as usize {
                        break;
                    }
                }
            }
        }

        if prepares.len() != event_count as usize {
            debug!(
                transaction_position,
                found = prepares.len(),
                expected = event_count,
                "Transaction has fewer prepares than its commit announces"
            );
        }
        Ok(prepares)
    }

    pub fn chunk_infos(&self) -> Vec<ChunkInfo> {
        let (active_number, active_size) = {
            let active = self.active.lock();
            (active.number(), active.data_size)
        };
        let chunk_size = self.config.chunk_size;
        let handles = self.chunks.read().clone();

        handles
            .iter()
            .map(|handle| {
                let start_position = handle.number as u64 * chunk_size;
                match &*handle.data.read() {
                    ChunkData::Sealed(chunk) => ChunkInfo {
                        chunk_number: handle.number,
                        start_position,
                        end_position: start_position + chunk.footer.logical_size,
                        completed: true,
                        scavenge_version: chunk.header.scavenge_version,
                        file_size: chunk.file_size(),
                    },
                    ChunkData::Active { header, .. } => {
                        let size = if handle.number == active_number { active_size } else { 0 };
                        ChunkInfo {
                            chunk_number: handle.number,
                            start_position,
                            end_position: start_position + size,
                            completed: false,
                            scavenge_version: header.scavenge_version,
                            file_size: CHUNK_HEADER_SIZE as u64 + size,
                        }
                    }
                }
            })
            .collect()
    }

    /// Scavenge version of every chunk.
    pub fn chunk_versions(&self) -> BTreeMap<u32, u32> {
        self.chunk_infos()
            .into_iter()
            .map(|info| (info.chunk_number, info.scavenge_version))
            .collect()
    }

    /// Start the replacement file for a completed chunk.
    pub(crate) fn create_scavenge_output(&self, chunk_number: u32, scavenge_version: u32) -> Result<ActiveChunk> {
        let path = self.dir.join(format!(
            "{}.{}",
            chunk_file_name(chunk_number),
            SCAVENGE_TEMP_EXTENSION
        ));
        let header = ChunkHeader {
            chunk_number,
            chunk_size: self.config.chunk_size,
            created_at: now_millis(),
            scavenge_version,
        };
        ActiveChunk::create(&path, header)
    }

    /// Atomically replace a completed chunk with a sealed scavenge output.
    ///
    /// Reads of that chunk are blocked while `before_swap` runs and the file
    /// is renamed into place. With `verify` the output's whole-chunk checksum
    /// is checked first.
    pub(crate) fn replace_chunk<F>(
        &self,
        chunk_number: u32,
        output: ActiveChunk,
        verify: bool,
        before_swap: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let handle = self.chunk(chunk_number).ok_or_else(|| Error::Scavenge {
            reason: format!("chunk #{} does not exist", chunk_number),
        })?;

        let temp_path = output.path.clone();
        drop(output);
        let mut sealed = SealedChunk::open(&temp_path, chunk_number, verify)?;

        let mut data = handle.data.write();
        if !matches!(&*data, ChunkData::Sealed(_)) {
            return Err(Error::Scavenge {
                reason: format!("chunk #{} is not completed", chunk_number),
            });
        }

        before_swap()?;

        let final_path = self.dir.join(chunk_file_name(chunk_number));
        std::fs::rename(&temp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        sealed.path = final_path;
        *data = ChunkData::Sealed(sealed);
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!(chunk = chunk_number, "Chunk replaced");
        Ok(())
    }
}

fn create_chunk(dir: &Path, chunk_number: u32, chunk_size: u64, scavenge_version: u32) -> Result<ActiveChunk> {
    let header = ChunkHeader {
        chunk_number,
        chunk_size,
        created_at: now_millis(),
        scavenge_version,
    };
    ActiveChunk::create(&dir.join(chunk_file_name(chunk_number)), header)
}

fn check_chunk_size(header: &ChunkHeader, configured: u64) -> Result<()> {
    if header.chunk_size != configured {
        return Err(Error::Configuration {
            message: format!(
                "chunk #{} was written with chunk size {}, configured {}",
                header.chunk_number, header.chunk_size, configured
            ),
        });
    }
    Ok(())
}
