//! Storage Engine
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Storage Engine                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Write Path:                                                │
//! │  ┌─────────┐    ┌────────┐    ┌──────────┐    ┌──────────┐  │
//! │  │ Request │───>│ Writer │───>│ ChunkLog │───>│writer.chk│  │
//! │  └─────────┘    └────────┘    └──────────┘    └────┬─────┘  │
//! │                                                    │ watch  │
//! │                                                    ▼        │
//! │  ┌───────────┐    ┌─────────────────┐    ┌────────────┐     │
//! │  │chaser.chk │<───│ TableIndex/Cache│<───│   Chaser   │     │
//! │  └───────────┘    └─────────────────┘    └────────────┘     │
//! │                                                             │
//! │  Read Path:                                                 │
//! │  ┌─────────┐    ┌───────────┐    ┌────────────┐             │
//! │  │  Query  │───>│ ReadIndex │───>│ Index+Log  │             │
//! │  └─────────┘    └───────────┘    └────────────┘             │
//! │                                                             │
//! │  Recovery Path:                                             │
//! │  ┌──────────┐    ┌──────────────┐    ┌───────────────┐      │
//! │  │ ChunkLog │───>│ checkpoints  │───>│ Chaser replay │      │
//! │  │ tail cut │    │ reconciled   │    │ from persisted│      │
//! │  └──────────┘    └──────────────┘    └───────────────┘      │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chronicle_core::{
    config::NodeConfig,
    error::{Error, Result, ResultExt},
    metrics::Metrics,
    traits::{EventStore, ScavengeStatus, StorageStats},
    AllEventsSlice, ExpectedVersion, LogPosition, NewEvent, ReadEventResult, ReadStreamResult,
    WriteResult,
};

use crate::cache::StreamInfoCache;
use crate::chaser::Chaser;
use crate::checkpoint::{Checkpoint, CHASER_CHECKPOINT_FILE, WRITER_CHECKPOINT_FILE};
use crate::chunk::ChunkLog;
use crate::read_index::ReadIndex;
use crate::scavenger::{ScavengeResult, Scavenger};
use crate::table_index::TableIndex;
use crate::writer::Writer;

pub const INDEX_DIR: &str = "index";

pub struct StorageEngine {
    config: NodeConfig,
    log: Arc<ChunkLog>,
    writer_checkpoint: Arc<Checkpoint>,
    chaser_checkpoint: Arc<Checkpoint>,
    index: Arc<TableIndex>,
    cache: Arc<StreamInfoCache>,
    read_index: Arc<ReadIndex>,
    writer: Writer,
    chaser: Arc<Chaser>,
    chaser_task: Mutex<Option<JoinHandle<()>>>,
    scavenger: Arc<Scavenger>,
    metrics: Metrics,
    shutdown: watch::Sender<bool>,
    /// Separate so the chaser keeps running while the writer drains.
    chaser_shutdown: watch::Sender<bool>,
}

impl StorageEngine {
    /// Open the database, recover, rebuild what the index is missing and
    /// start the writer and chaser.
    pub async fn open(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new();
        let db_path = config.db.path.clone();

        let log = Arc::new(
            ChunkLog::open(&config.db, metrics.clone())
                .with_context(|| format!("opening transaction log in {:?}", db_path))?,
        );
        let writer_checkpoint = Arc::new(Checkpoint::open(db_path.join(WRITER_CHECKPOINT_FILE), "writer")?);
        let chaser_checkpoint = Arc::new(Checkpoint::open(db_path.join(CHASER_CHECKPOINT_FILE), "chaser")?);
        reconcile_checkpoints(&log, &writer_checkpoint, &chaser_checkpoint)?;

        let index = Arc::new(
            TableIndex::open(db_path.join(INDEX_DIR), &config.index, metrics.clone())
                .with_context(|| "opening table index".to_string())?,
        );
        let log_versions = log.chunk_versions();
        if !index.matches_chunk_versions(&log_versions) {
            warn!("Index was built against different chunk versions, rebuilding");
            index.reset(log_versions)?;
        } else if index.persisted_position() > writer_checkpoint.read() {
            warn!(
                persisted = index.persisted_position(),
                log_end = writer_checkpoint.read(),
                "Index is ahead of the log, rebuilding"
            );
            index.reset(log_versions)?;
        }

        let cache = Arc::new(StreamInfoCache::new(config.cache.stream_info_capacity));
        let read_index = Arc::new(ReadIndex::new(
            log.clone(),
            index.clone(),
            cache.clone(),
            chaser_checkpoint.clone(),
            metrics.clone(),
        ));
        let chaser = Arc::new(Chaser::new(
            log.clone(),
            index.clone(),
            cache.clone(),
            writer_checkpoint.clone(),
            chaser_checkpoint.clone(),
            metrics.clone(),
        ));

        let replay_from = index.persisted_position().min(chaser_checkpoint.read());
        let replayed = {
            let chaser = chaser.clone();
            tokio::task::spawn_blocking(move || chaser.replay_from(replay_from))
                .await
                .map_err(|e| Error::Internal {
                    message: format!("index replay panicked: {}", e),
                })??
        };
        if replayed > 0 {
            info!(records = replayed, from = replay_from, "Recovered index from log");
        }

        let (shutdown, _) = watch::channel(false);
        let (chaser_shutdown, _) = watch::channel(false);
        let writer = Writer::start(
            log.clone(),
            writer_checkpoint.clone(),
            chaser_checkpoint.clone(),
            read_index.clone(),
            &config.writer,
            metrics.clone(),
            shutdown.subscribe(),
            chaser.subscribe_failures(),
        );
        let chaser_task = chaser.start(chaser_shutdown.subscribe());
        let scavenger = Arc::new(Scavenger::new(
            log.clone(),
            index.clone(),
            read_index.clone(),
            chaser_checkpoint.clone(),
            &config.scavenge,
            metrics.clone(),
        ));

        info!(
            path = ?db_path,
            writer_checkpoint = writer_checkpoint.read(),
            chaser_checkpoint = chaser_checkpoint.read(),
            "Storage engine opened"
        );

        Ok(Self {
            config,
            log,
            writer_checkpoint,
            chaser_checkpoint,
            index,
            cache,
            read_index,
            writer,
            chaser,
            chaser_task: Mutex::new(Some(chaser_task)),
            scavenger,
            metrics,
            shutdown,
            chaser_shutdown,
        })
    }

    /// Open with default settings in `path`.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(NodeConfig::with_db_path(path.as_ref())).await
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<ChunkLog> {
        &self.log
    }

    pub fn index(&self) -> &Arc<TableIndex> {
        &self.index
    }

    pub fn read_index(&self) -> &Arc<ReadIndex> {
        &self.read_index
    }

    /// Raw access to the append path, without waiting for the chaser.
    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn chaser(&self) -> &Arc<Chaser> {
        &self.chaser
    }

    pub fn scavenger(&self) -> &Arc<Scavenger> {
        &self.scavenger
    }

    pub fn writer_checkpoint(&self) -> u64 {
        self.writer_checkpoint.read()
    }

    pub fn chaser_checkpoint(&self) -> u64 {
        self.chaser_checkpoint.read()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Append and wait until the commit is visible to reads.
    pub async fn write_events(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteResult> {
        let result = self.writer.write_events(stream, expected, events).await?;
        self.wait_for_commit(&result).await;
        Ok(result)
    }

    pub async fn delete_stream(&self, stream: &str, expected: ExpectedVersion) -> Result<WriteResult> {
        let result = self.writer.delete_stream(stream, expected).await?;
        self.wait_for_commit(&result).await;
        Ok(result)
    }

    async fn wait_for_commit(&self, result: &WriteResult) {
        if let Some(commit_position) = result.commit_position {
            self.chaser_checkpoint.wait_for(commit_position + 1).await;
        }
    }

    /// Wait until the chaser has applied everything before `position`.
    pub async fn wait_for_chaser(&self, position: u64) {
        self.chaser_checkpoint.wait_for(position).await;
    }

    pub fn read_event(&self, stream: &str, event_number: i32) -> Result<ReadEventResult> {
        self.read_index.read_event(stream, event_number)
    }

    pub fn read_stream_forward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult> {
        self.read_index.read_stream_events_forward(stream, from, max_count)
    }

    pub fn read_stream_backward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult> {
        self.read_index.read_stream_events_backward(stream, from, max_count)
    }

    pub fn read_all_forward(&self, position: LogPosition, max_count: usize) -> Result<AllEventsSlice> {
        self.read_index.read_all_forward(position, max_count)
    }

    pub fn start_scavenge(&self) -> ScavengeStatus {
        self.scavenger.start_scavenge()
    }

    /// Run a scavenge pass to completion. `None` if one was already running.
    pub async fn scavenge(&self) -> Result<Option<ScavengeResult>> {
        let scavenger = self.scavenger.clone();
        let outcome = tokio::task::spawn_blocking(move || scavenger.scavenge())
            .await
            .map_err(|e| Error::Internal {
                message: format!("scavenge panicked: {}", e),
            })?;
        outcome.transpose()
    }

    pub fn get_stats(&self) -> StorageStats {
        let chunks = self.log.chunk_infos();
        let index = self.index.stats();
        let cache = self.cache.stats();
        StorageStats {
            writer_checkpoint: self.writer_checkpoint.read(),
            chaser_checkpoint: self.chaser_checkpoint.read(),
            chaser_state: self.chaser.state().to_string(),
            chunk_count: chunks.len(),
            completed_chunks: chunks.iter().filter(|c| c.completed).count(),
            memtable_entries: index.memtable_entries,
            index_entries: index.persisted_entries + index.memtable_entries as u64,
            index_levels: index.levels,
            index_persisted_position: index.persisted_position,
            cache_entries: cache.entries,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            scavenge_running: self.scavenger.is_running(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Stop accepting writes, drain the queue, let the chaser finish and
    /// persist the index.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down storage engine");
        self.scavenger.request_stop();
        let _ = self.shutdown.send(true);

        self.writer.join().await;
        let _ = self.chaser_shutdown.send(true);
        let chaser_task = self.chaser_task.lock().take();
        if let Some(task) = chaser_task {
            if let Err(e) = task.await {
                error!("Chaser task failed: {}", e);
            }
        }

        let chaser = self.chaser.clone();
        tokio::task::spawn_blocking(move || chaser.catch_up())
            .await
            .map_err(|e| Error::Internal {
                message: format!("final chase panicked: {}", e),
            })??;
        self.index.flush()?;

        info!(
            writer_checkpoint = self.writer_checkpoint.read(),
            chaser_checkpoint = self.chaser_checkpoint.read(),
            "Storage engine stopped"
        );
        Ok(())
    }
}

/// Align the writer checkpoint with the recovered end of the log and keep
/// the chaser at or below it.
fn reconcile_checkpoints(log: &ChunkLog, writer: &Checkpoint, chaser: &Checkpoint) -> Result<()> {
    let log_end = log.writer_position();
    if writer.read() != log_end {
        warn!(
            checkpoint = writer.read(),
            log_end, "Writer checkpoint does not match the end of the log, resetting"
        );
        writer.reset(log_end)?;
    }
    if chaser.read() > log_end {
        warn!(checkpoint = chaser.read(), log_end, "Chaser checkpoint past the end of the log, resetting");
        chaser.reset(log_end)?;
    }
    Ok(())
}

#[async_trait]
impl EventStore for StorageEngine {
    async fn append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteResult> {
        self.write_events(stream, expected_version, events).await
    }

    async fn delete_stream(&self, stream: &str, expected_version: ExpectedVersion) -> Result<WriteResult> {
        StorageEngine::delete_stream(self, stream, expected_version).await
    }

    async fn read_event(&self, stream: &str, event_number: i32) -> Result<ReadEventResult> {
        StorageEngine::read_event(self, stream, event_number)
    }

    async fn read_stream_forward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult> {
        StorageEngine::read_stream_forward(self, stream, from, max_count)
    }

    async fn read_stream_backward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult> {
        StorageEngine::read_stream_backward(self, stream, from, max_count)
    }

    async fn read_all_forward(&self, position: LogPosition, max_count: usize) -> Result<AllEventsSlice> {
        StorageEngine::read_all_forward(self, position, max_count)
    }

    fn start_scavenge(&self) -> ScavengeStatus {
        StorageEngine::start_scavenge(self)
    }

    async fn stats(&self) -> Result<StorageStats> {
        Ok(self.get_stats())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        let _ = self.chaser_shutdown.send(true);
    }
}
