//! # Scavenger
//!
//! Online compaction of completed chunks.
//!
//! For every completed chunk fully below the commit point the scavenger
//! decides per record whether it is still needed, writes the survivors to a
//! `chunk-NNNNNN.chk.scavenge` file and swaps it in together with the index
//! relocation. Until the rename, the old chunk stays authoritative; a crash
//! leaves a temp file that the next open removes.
//!
//! | record                                   | outcome            |
//! |------------------------------------------|--------------------|
//! | tombstone prepare or its commit          | kept               |
//! | prepare of a deleted stream              | discarded          |
//! | prepare committed inside the chunk       | kept               |
//! | prepare committed in another chunk       | chunk skipped      |
//! | uncommitted prepare, younger than limit  | chunk skipped      |
//! | uncommitted prepare, older than limit    | discarded          |
//! | commit whose prepares were all discarded | discarded          |

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use chronicle_core::{
    config::ScavengeConfig,
    error::{Error, Result},
    metrics::{Metrics, Timer},
    traits::ScavengeStatus,
    utils::{format_bytes, now_millis, stream_hash},
    LogRecord, DELETED_STREAM,
};

use crate::checkpoint::Checkpoint;
use crate::chunk::{encode_frame, ChunkInfo, ChunkLog, LogEntry};
use crate::compaction::RelocationMap;
use crate::read_index::ReadIndex;
use crate::table_index::TableIndex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScavengeResult {
    pub started_at: DateTime<Utc>,
    pub chunks_scavenged: u64,
    pub chunks_skipped: u64,
    pub records_kept: u64,
    pub records_discarded: u64,
    pub bytes_reclaimed: u64,
    pub elapsed_ms: u64,
    pub stopped_early: bool,
}

enum ChunkOutcome {
    Replaced { kept: u64, discarded: u64, bytes_reclaimed: u64 },
    Unchanged { kept: u64 },
    Skipped { reason: &'static str },
}

pub struct Scavenger {
    log: Arc<ChunkLog>,
    index: Arc<TableIndex>,
    read_index: Arc<ReadIndex>,
    chaser_checkpoint: Arc<Checkpoint>,
    config: ScavengeConfig,
    running: AtomicBool,
    stop_requested: AtomicBool,
    last_result: Mutex<Option<ScavengeResult>>,
    metrics: Metrics,
}

impl Scavenger {
    pub fn new(
        log: Arc<ChunkLog>,
        index: Arc<TableIndex>,
        read_index: Arc<ReadIndex>,
        chaser_checkpoint: Arc<Checkpoint>,
        config: &ScavengeConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            log,
            index,
            read_index,
            chaser_checkpoint,
            config: config.clone(),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            last_result: Mutex::new(None),
            metrics,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<ScavengeResult> {
        self.last_result.lock().clone()
    }

    /// Stop the running pass after the chunk in progress.
    pub fn request_stop(&self) {
        if self.is_running() {
            self.stop_requested.store(true, Ordering::Release);
        }
    }

    /// Run a pass on the blocking pool. A second call while one is running
    /// does nothing.
    pub fn start_scavenge(self: &Arc<Self>) -> ScavengeStatus {
        if !self.try_begin() {
            return ScavengeStatus::AlreadyRunning;
        }
        let scavenger = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = scavenger.run_and_finish() {
                error!(error = %e, "Scavenge failed");
            }
        });
        ScavengeStatus::Started
    }

    /// Run a pass on the calling thread. `None` if one is already running.
    pub fn scavenge(&self) -> Option<Result<ScavengeResult>> {
        if !self.try_begin() {
            return None;
        }
        Some(self.run_and_finish())
    }

    fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn run_and_finish(&self) -> Result<ScavengeResult> {
        let result = self.run_pass();
        if let Ok(result) = &result {
            *self.last_result.lock() = Some(result.clone());
        }
        self.stop_requested.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        result
    }

    fn run_pass(&self) -> Result<ScavengeResult> {
        let timer = Timer::start();
        self.index.flush()?;
        let limit = self.chaser_checkpoint.read().min(self.index.persisted_position());
        info!(limit, "Scavenge started");

        let mut result = ScavengeResult {
            started_at: Utc::now(),
            ..ScavengeResult::default()
        };
        let chunks: Vec<ChunkInfo> = self
            .log
            .chunk_infos()
            .into_iter()
            .filter(|c| c.completed && c.end_position <= limit)
            .collect();

        for chunk in chunks {
            if self.stop_requested.load(Ordering::Acquire) {
                info!(chunk = chunk.chunk_number, "Scavenge stopped on request");
                result.stopped_early = true;
                break;
            }

            match self.scavenge_chunk(&chunk)? {
                ChunkOutcome::Replaced { kept, discarded, bytes_reclaimed } => {
                    result.chunks_scavenged += 1;
                    result.records_kept += kept;
                    result.records_discarded += discarded;
                    result.bytes_reclaimed += bytes_reclaimed;
                    self.metrics.record_chunk_scavenged(discarded, bytes_reclaimed);
                }
                ChunkOutcome::Unchanged { kept } => {
                    result.records_kept += kept;
                }
                ChunkOutcome::Skipped { reason } => {
                    debug!(chunk = chunk.chunk_number, reason, "Chunk skipped");
                    result.chunks_skipped += 1;
                }
            }
        }

        result.elapsed_ms = timer.elapsed_ms();
        self.metrics.record_scavenge_pass();
        info!(
            scavenged = result.chunks_scavenged,
            skipped = result.chunks_skipped,
            discarded = result.records_discarded,
            reclaimed = %format_bytes(result.bytes_reclaimed),
            elapsed_ms = result.elapsed_ms,
            "Scavenge finished"
        );
        Ok(result)
    }

    fn scavenge_chunk(&self, chunk: &ChunkInfo) -> Result<ChunkOutcome> {
        let records: Vec<LogEntry> = self
            .log
            .read_sequential_from(chunk.start_position, chunk.end_position)
            .collect::<Result<_>>()?;

        let in_chunk = |position: u64| position >= chunk.start_position && position < chunk.end_position;

        // Transactions committed by a commit inside this chunk.
        let committed: HashSet<u64> = records
            .iter()
            .filter_map(|e| match &e.record {
                LogRecord::Commit(c) => Some(c.transaction_position),
                _ => None,
            })
            .collect();

        let orphan_cutoff = now_millis() - self.config.orphan_prepare_age().as_millis() as i64;
        let mut deleted: HashMap<String, bool> = HashMap::new();
        // Indexed positions inside this chunk, per stream, loaded on first use.
        let mut indexed: HashMap<String, HashSet<u64>> = HashMap::new();
        let mut keep = vec![true; records.len()];
        let mut live_transactions: HashSet<u64> = HashSet::new();

        for (i, entry) in records.iter().enumerate() {
            let prepare = match &entry.record {
                LogRecord::Prepare(p) => p,
                LogRecord::Commit(_) => continue,
            };

            if prepare.is_tombstone() {
                live_transactions.insert(prepare.transaction_position);
                continue;
            }

            let stream_deleted = match deleted.get(&prepare.stream_id) {
                Some(d) => *d,
                None => {
                    let d = self.read_index.is_stream_deleted(&prepare.stream_id)?;
                    deleted.insert(prepare.stream_id.clone(), d);
                    d
                }
            };
            if stream_deleted {
                keep[i] = false;
                continue;
            }

            if committed.contains(&prepare.transaction_position) {
                live_transactions.insert(prepare.transaction_position);
                continue;
            }

            let positions = indexed
                .entry(prepare.stream_id.clone())
                .or_insert_with(|| self.indexed_positions(&prepare.stream_id, chunk));
            if positions.contains(&entry.position) {
                return Ok(ChunkOutcome::Skipped {
                    reason: "transaction committed in another chunk",
                });
            }
            if prepare.timestamp > orphan_cutoff {
                return Ok(ChunkOutcome::Skipped {
                    reason: "uncommitted prepare younger than the orphan limit",
                });
            }
            keep[i] = false;
        }

        for (i, entry) in records.iter().enumerate() {
            if let LogRecord::Commit(c) = &entry.record {
                if in_chunk(c.transaction_position) && !live_transactions.contains(&c.transaction_position) {
                    keep[i] = false;
                }
            }
        }

        let discarded = keep.iter().filter(|k| !**k).count() as u64;
        let kept = records.len() as u64 - discarded;
        if discarded == 0 {
            return Ok(ChunkOutcome::Unchanged { kept });
        }

        let version = chunk.scavenge_version + 1;
        let mut output = self.log.create_scavenge_output(chunk.chunk_number, version)?;
        let temp_path = output.path.clone();

        let built = (|| -> Result<RelocationMap> {
            let mut relocations = RelocationMap::new();
            let mut new_transaction_positions: HashMap<u64, u64> = HashMap::new();

            for (entry, keep) in records.iter().zip(&keep) {
                if !keep {
                    if let LogRecord::Prepare(_) = entry.record {
                        relocations.insert(entry.position, None);
                    }
                    continue;
                }

                let new_position = chunk.start_position + output.data_size;
                let mut record = entry.record.clone();
                match &mut record {
                    LogRecord::Prepare(p) => {
                        if in_chunk(p.transaction_position) {
                            let remapped = *new_transaction_positions
                                .entry(p.transaction_position)
                                .or_insert(new_position);
                            p.transaction_position = remapped;
                        }
                        relocations.insert(entry.position, Some(new_position));
                    }
                    LogRecord::Commit(c) => {
                        if let Some(remapped) = new_transaction_positions.get(&c.transaction_position) {
                            c.transaction_position = *remapped;
                        }
                    }
                }
                output.append(&encode_frame(&record)?)?;
            }

            output.seal()?;
            Ok(relocations)
        })();

        let relocations = match built {
            Ok(relocations) => relocations,
            Err(e) => {
                drop(output);
                remove_temp(&temp_path);
                return Err(e);
            }
        };

        let new_size = output.data_size;
        let bytes_reclaimed = (chunk.end_position - chunk.start_position).saturating_sub(new_size);
        let (start, end) = (chunk.start_position, chunk.end_position);

        let swapped = self.log.replace_chunk(chunk.chunk_number, output, self.config.verify_records, || {
            self.index.relocate(&relocations, chunk.chunk_number, version, start, end)
        });
        if let Err(e) = swapped {
            remove_temp(&temp_path);
            return Err(Error::Scavenge {
                reason: format!("chunk #{} not replaced: {}", chunk.chunk_number, e),
            });
        }

        info!(
            chunk = chunk.chunk_number,
            version,
            kept,
            discarded,
            bytes_reclaimed,
            "Chunk scavenged"
        );
        Ok(ChunkOutcome::Replaced {
            kept,
            discarded,
            bytes_reclaimed,
        })
    }

    /// Positions inside `chunk` that index entries of `stream` point at.
    ///
    /// A prepare does not carry its event number, so this is one range scan
    /// per stream and chunk rather than a point lookup.
    fn indexed_positions(&self, stream: &str, chunk: &ChunkInfo) -> HashSet<u64> {
        self.index
            .range(stream_hash(stream), 0, DELETED_STREAM)
            .into_iter()
            .map(|e| e.position)
            .filter(|&p| p >= chunk.start_position && p < chunk.end_position)
            .collect()
    }
}

fn remove_temp(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove scavenge output {:?}: {}", path, e);
        }
    }
}
