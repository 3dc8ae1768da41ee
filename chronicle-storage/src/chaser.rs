//! # Chaser
//!
//! Follows the writer checkpoint and applies every record between its own
//! checkpoint and the writer's to the index and cache. Its checkpoint is
//! the commit point for readers: anything below it is visible.
//!
//! ```text
//!   writer.chk ──watch──▶ Chaser ── read ──▶ ChunkLog
//!                           │
//!                           ├─▶ TableIndex.add   (commit ⇒ entries)
//!                           ├─▶ StreamInfoCache
//!                           └─▶ chaser.chk       (fsync per record)
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use chronicle_core::{
    error::Result, metrics::Metrics, utils::stream_hash, CommitRecord, LogRecord, DELETED_STREAM,
};

use crate::cache::StreamInfoCache;
use crate::checkpoint::Checkpoint;
use crate::chunk::ChunkLog;
use crate::memtable::IndexEntry;
use crate::table_index::TableIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChaserState {
    Idle = 0,
    CatchingUp = 1,
}

impl std::fmt::Display for ChaserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChaserState::Idle => write!(f, "idle"),
            ChaserState::CatchingUp => write!(f, "catching-up"),
        }
    }
}

pub struct Chaser {
    log: Arc<ChunkLog>,
    index: Arc<TableIndex>,
    cache: Arc<StreamInfoCache>,
    writer_checkpoint: Arc<Checkpoint>,
    chaser_checkpoint: Arc<Checkpoint>,
    state: AtomicU8,
    pass: Mutex<()>,
    /// Reason of the last failed pass, cleared by the next good one.
    failures: watch::Sender<Option<String>>,
    metrics: Metrics,
}

impl Chaser {
    pub fn new(
        log: Arc<ChunkLog>,
        index: Arc<TableIndex>,
        cache: Arc<StreamInfoCache>,
        writer_checkpoint: Arc<Checkpoint>,
        chaser_checkpoint: Arc<Checkpoint>,
        metrics: Metrics,
    ) -> Self {
        Self {
            log,
            index,
            cache,
            writer_checkpoint,
            chaser_checkpoint,
            state: AtomicU8::new(ChaserState::Idle as u8),
            pass: Mutex::new(()),
            failures: watch::channel(None).0,
            metrics,
        }
    }

    pub fn state(&self) -> ChaserState {
        match self.state.load(Ordering::Acquire) {
            1 => ChaserState::CatchingUp,
            _ => ChaserState::Idle,
        }
    }

    /// Apply everything up to the writer checkpoint. Returns the number of
    /// records applied.
    pub fn catch_up(&self) -> Result<u64> {
        let _pass = self.pass.lock();
        self.state.store(ChaserState::CatchingUp as u8, Ordering::Release);
        let result = self.catch_up_locked();
        self.state.store(ChaserState::Idle as u8, Ordering::Release);
        self.report(&result);
        result
    }

    /// Watch the outcome of chaser passes: `Some(reason)` while the last
    /// pass failed.
    pub fn subscribe_failures(&self) -> watch::Receiver<Option<String>> {
        self.failures.subscribe()
    }

    pub fn last_failure(&self) -> Option<String> {
        self.failures.borrow().clone()
    }

    fn report<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.failures.send_if_modified(|failure| failure.take().is_some());
            }
            Err(e) => {
                self.failures.send_replace(Some(e.to_string()));
            }
        }
    }

    fn catch_up_locked(&self) -> Result<u64> {
        let mut applied = 0;
        loop {
            let from = self.chaser_checkpoint.read();
            let to = self.writer_checkpoint.read();
            if from >= to {
                return Ok(applied);
            }
            applied += self.apply_range(from, to, true)?;
            if self.chaser_checkpoint.read() == from {
                // Nothing readable between the checkpoints.
                return Ok(applied);
            }
        }
    }

    /// Re-apply records from `position` up to the chaser checkpoint, then
    /// catch up. Used at startup to rebuild the part of the index that was
    /// never persisted; applying twice has no effect.
    pub fn replay_from(&self, position: u64) -> Result<u64> {
        let _pass = self.pass.lock();
        let chased = self.chaser_checkpoint.read();
        let mut applied = 0;
        if position < chased {
            info!(from = position, to = chased, "Replaying log into index");
            applied += self.apply_range(position, chased, false)?;
        }
        applied += self.catch_up_locked()?;
        Ok(applied)
    }

    fn apply_range(&self, from: u64, to: u64, advance: bool) -> Result<u64> {
        let mut reader = self.log.read_sequential_from(from, to);
        let mut applied = 0u64;
        let mut entries_added = 0u64;

        for entry in reader.by_ref() {
            let entry = entry?;
            if let LogRecord::Commit(commit) = &entry.record {
                entries_added += self.apply_commit(commit, entry.position, entry.next_position)?;
            }
            applied += 1;
            if advance {
                self.chaser_checkpoint.advance_to(entry.next_position)?;
            }
        }

        let end = reader.position();
        self.index.add(&[], end)?;
        if advance {
            self.chaser_checkpoint.advance_to(end)?;
        }

        if applied > 0 {
            self.metrics.record_chased(applied, entries_added);
            debug!(from, to = end, records = applied, "Chased log range");
        }
        Ok(applied)
    }

    fn apply_commit(&self, commit: &CommitRecord, commit_position: u64, next_position: u64) -> Result<u64> {
        let prepares = self
            .log
            .read_transaction(commit.transaction_position, commit_position, commit.event_count)?;
        let stream = match prepares.first() {
            Some((_, prepare)) => prepare.stream_id.clone(),
            None => return Ok(0),
        };
        let hash = stream_hash(&stream);
        let deleted = commit.first_event_number == DELETED_STREAM;

        let entries: Vec<IndexEntry> = prepares
            .iter()
            .enumerate()
            .map(|(i, (position, prepare))| {
                let number = if deleted || prepare.is_tombstone() {
                    DELETED_STREAM
                } else {
                    commit.first_event_number + i as i32
                };
                IndexEntry::new(hash, number, *position)
            })
            .collect();

        self.index.add(&entries, next_position)?;
        if deleted {
            self.cache.on_commit(&stream, -1, true);
        } else {
            let last = commit.first_event_number + entries.len() as i32 - 1;
            self.cache.on_commit(&stream, last, false);
        }
        Ok(entries.len() as u64)
    }

    /// Follow the writer checkpoint until `shutdown` flips.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let chaser = Arc::clone(self);
        let mut updates = self.writer_checkpoint.subscribe();

        tokio::spawn(async move {
            info!("Chaser started");
            loop {
                let pass = {
                    let chaser = Arc::clone(&chaser);
                    tokio::task::spawn_blocking(move || chaser.catch_up())
                };
                match pass.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "Chaser pass failed"),
                    Err(e) => {
                        error!("Chaser pass panicked: {}", e);
                        chaser.failures.send_replace(Some(format!("chaser pass panicked: {}", e)));
                    }
                }

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Chaser stopped");
        })
    }
}
