//! # Writer
//!
//! Single owner of the append path.
//!
//! ```text
//!   write_events ─┐
//!   delete_stream ├─▶ mpsc queue ─▶ writer task ─▶ ChunkLog.append ×N
//!   append_*      ┘                     │
//!                                       ├─▶ ChunkLog.flush (one fsync per batch)
//!                                       ├─▶ writer checkpoint
//!                                       └─▶ oneshot replies
//! ```
//!
//! Requests queued while a batch is being written are picked up together
//! and share a single fsync. The writer keeps its own view of stream
//! versions so expected-version checks include writes the chaser has not
//! applied yet.
//!
//! A request that is rejected before it appends anything fails alone. Once
//! a request has touched the log, any failure fails the whole batch and the
//! log is rolled back to where the batch started, so nothing a caller was
//! told failed can reach the writer checkpoint.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chronicle_core::{
    config::WriterConfig,
    error::{Error, Result},
    metrics::Metrics,
    utils::now_millis,
    CommitRecord, ExpectedVersion, LogRecord, NewEvent, PrepareFlags, PrepareRecord, StreamVersion,
    WriteResult, DELETED_STREAM, STREAM_DELETED_EVENT_TYPE,
};

use crate::checkpoint::Checkpoint;
use crate::chunk::{frame_len, ChunkLog, LogMark};
use crate::read_index::ReadIndex;

enum WriteOp {
    Events {
        stream: String,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    },
    Delete {
        stream: String,
        expected: ExpectedVersion,
    },
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    CompleteChunk,
}

impl WriteOp {
    fn stream(&self) -> Option<&str> {
        match self {
            WriteOp::Events { stream, .. } | WriteOp::Delete { stream, .. } => Some(stream),
            _ => None,
        }
    }
}

enum WriteReply {
    Write(WriteResult),
    Position(u64),
    Completed(bool),
}

struct WriteRequest {
    op: WriteOp,
    response: oneshot::Sender<Result<WriteReply>>,
}

pub struct Writer {
    sender: mpsc::Sender<WriteRequest>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    /// Spawn the writer task. It runs until `shutdown` flips to `true`, then
    /// drains what is already queued.
    pub fn start(
        log: Arc<ChunkLog>,
        writer_checkpoint: Arc<Checkpoint>,
        chaser_checkpoint: Arc<Checkpoint>,
        read_index: Arc<ReadIndex>,
        config: &WriterConfig,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
        chaser_failures: watch::Receiver<Option<String>>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let capacity = NonZeroUsize::new(config.stream_version_capacity).unwrap_or(NonZeroUsize::MIN);

        let task = WriterTask {
            log,
            writer_checkpoint,
            chaser_checkpoint,
            read_index,
            chaser_failures,
            versions: LruCache::new(capacity),
            pending_transactions: HashMap::new(),
            max_batch_size: config.max_batch_size.max(1),
            metrics,
        };
        let handle = tokio::spawn(task.run(receiver, shutdown));

        Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn submit(&self, op: WriteOp) -> Result<WriteReply> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriteRequest { op, response: tx })
            .await
            .map_err(|_| Error::Shutdown {
                component: "writer".to_string(),
            })?;

        rx.await.map_err(|_| Error::Shutdown {
            component: "writer".to_string(),
        })?
    }

    /// Append `events` to `stream` as one transaction.
    pub async fn write_events(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteResult> {
        match self
            .submit(WriteOp::Events {
                stream: stream.to_string(),
                expected,
                events,
            })
            .await?
        {
            WriteReply::Write(result) => Ok(result),
            _ => Err(unexpected_reply()),
        }
    }

    /// Write a tombstone for `stream`.
    pub async fn delete_stream(&self, stream: &str, expected: ExpectedVersion) -> Result<WriteResult> {
        match self
            .submit(WriteOp::Delete {
                stream: stream.to_string(),
                expected,
            })
            .await?
        {
            WriteReply::Write(result) => Ok(result),
            _ => Err(unexpected_reply()),
        }
    }

    /// Append a raw prepare. A `TRANSACTION_BEGIN` prepare is stamped with
    /// its own position as transaction position.
    pub async fn append_prepare(&self, prepare: PrepareRecord) -> Result<u64> {
        match self.submit(WriteOp::Prepare(prepare)).await? {
            WriteReply::Position(position) => Ok(position),
            _ => Err(unexpected_reply()),
        }
    }

    pub async fn append_commit(&self, commit: CommitRecord) -> Result<u64> {
        match self.submit(WriteOp::Commit(commit)).await? {
            WriteReply::Position(position) => Ok(position),
            _ => Err(unexpected_reply()),
        }
    }

    /// Seal the active chunk. Returns `false` if it was empty.
    pub async fn complete_chunk(&self) -> Result<bool> {
        match self.submit(WriteOp::CompleteChunk).await? {
            WriteReply::Completed(done) => Ok(done),
            _ => Err(unexpected_reply()),
        }
    }

    /// Wait for the writer task to exit. The shutdown signal is owned by the
    /// caller.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Writer task failed: {}", e);
            }
        }
    }
}

fn unexpected_reply() -> Error {
    Error::Internal {
        message: "writer replied with the wrong kind of result".to_string(),
    }
}

struct WriterTask {
    log: Arc<ChunkLog>,
    writer_checkpoint: Arc<Checkpoint>,
    chaser_checkpoint: Arc<Checkpoint>,
    read_index: Arc<ReadIndex>,
    /// Reason of the chaser's last failed pass, `None` once a pass succeeds.
    chaser_failures: watch::Receiver<Option<String>>,
    versions: LruCache<String, StreamVersion>,
    /// Stream of every raw transaction begun but not yet committed.
    pending_transactions: HashMap<u64, String>,
    max_batch_size: usize,
    metrics: Metrics,
}

impl WriterTask {
    async fn run(mut self, mut receiver: mpsc::Receiver<WriteRequest>, mut shutdown: watch::Receiver<bool>) {
        info!("Writer started");
        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                request = receiver.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while batch.len() < self.max_batch_size {
                match receiver.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }

            self = match self.process(batch).await {
                Some(task) => task,
                None => return,
            };
        }

        receiver.close();
        let mut remaining = Vec::new();
        while let Ok(request) = receiver.try_recv() {
            remaining.push(request);
        }
        if !remaining.is_empty() {
            debug!(requests = remaining.len(), "Draining writer queue");
        }
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(self.max_batch_size));
            self = match self.process(std::mem::replace(&mut remaining, rest)).await {
                Some(task) => task,
                None => return,
            };
        }
        info!("Writer stopped");
    }

    /// Write one batch on the blocking pool and hand the task back.
    async fn process(mut self, batch: Vec<WriteRequest>) -> Option<Self> {
        let batch = match self.warm_versions(&batch).await {
            Ok(()) => batch,
            Err(reason) => self.reject_unwarmed(batch, &reason),
        };
        if batch.is_empty() {
            return Some(self);
        }
        match tokio::task::spawn_blocking(move || {
            self.write_batch(batch);
            self
        })
        .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                error!("Writer batch panicked, writer stopped: {}", e);
                None
            }
        }
    }

    /// Make sure the chaser has caught up before loading versions of
    /// streams the writer has not seen yet. Fails with the chaser's error if
    /// its last pass failed before reaching the writer checkpoint.
    async fn warm_versions(&mut self, batch: &[WriteRequest]) -> std::result::Result<(), String> {
        let misses: Vec<String> = batch
            .iter()
            .filter_map(|r| r.op.stream())
            .filter(|s| !self.versions.contains(*s))
            .map(str::to_string)
            .collect();
        if misses.is_empty() {
            return Ok(());
        }

        let target = self.writer_checkpoint.read();
        tokio::select! {
            biased;
            _ = self.chaser_checkpoint.wait_for(target) => {}
            reason = chaser_failed(&mut self.chaser_failures) => return Err(reason),
        }
        for stream in misses {
            if let Ok(version) = self.read_index.stream_version(&stream) {
                self.versions.put(stream, version);
            }
        }
        Ok(())
    }

    /// Fail the requests whose stream version could not be loaded and keep
    /// the rest.
    fn reject_unwarmed(&mut self, batch: Vec<WriteRequest>, reason: &str) -> Vec<WriteRequest> {
        warn!(reason = %reason, "Chaser is failing, rejecting writes to unloaded streams");
        let mut kept = Vec::with_capacity(batch.len());
        for request in batch {
            let unwarmed = request.op.stream().is_some_and(|s| !self.versions.contains(s));
            if unwarmed {
                let _ = request.response.send(Err(Error::WriteError {
                    message: format!("stream version unavailable, chaser failed: {}", reason),
                    source: None,
                }));
            } else {
                kept.push(request);
            }
        }
        kept
    }

    fn write_batch(&mut self, batch: Vec<WriteRequest>) {
        let start = self.log.writer_position();
        let batch_start = self.log.mark();
        let mut records = 0u64;
        let mut failure: Option<String> = None;
        let mut replies = Vec::with_capacity(batch.len());

        for request in batch {
            let result = if let Some(reason) = &failure {
                Err(batch_failed(reason))
            } else {
                let before = self.log.mark();
                let result = self.apply(request.op, &mut records);
                if let Err(e) = &result {
                    if self.log.mark() != before || self.log.is_poisoned() {
                        failure = Some(e.to_string());
                    }
                }
                result
            };
            replies.push((request.response, result));
        }

        let end = match self.log.flush() {
            Ok(end) => Some(end),
            Err(e) => {
                failure.get_or_insert_with(|| e.to_string());
                None
            }
        };
        if let Some(end) = end.filter(|_| failure.is_none()) {
            if let Err(e) = self.writer_checkpoint.write(end) {
                failure = Some(e.to_string());
            } else {
                self.metrics.record_write_batch(records, end.saturating_sub(start));
            }
        }

        if let Some(reason) = &failure {
            error!(reason = %reason, "Write batch failed");
            self.versions.clear();
            self.pending_transactions.clear();
            self.roll_back(batch_start);
        }

        for (response, result) in replies {
            let result = match (&failure, result) {
                (Some(reason), Ok(_)) => Err(batch_failed(reason)),
                (_, result) => result,
            };
            let _ = response.send(result);
        }
    }

    fn roll_back(&self, mark: LogMark) {
        if let Err(e) = self.log.rollback(mark) {
            error!(error = %e, "Could not roll back failed batch, log is read-only until restart");
        }
    }

    fn apply(&mut self, op: WriteOp, records: &mut u64) -> Result<WriteReply> {
        match op {
            WriteOp::Events { stream, expected, events } => {
                self.write_events(&stream, expected, events, records).map(WriteReply::Write)
            }
            WriteOp::Delete { stream, expected } => {
                self.delete_stream(&stream, expected, records).map(WriteReply::Write)
            }
            WriteOp::Prepare(prepare) => {
                *records += 1;
                self.append_prepare(prepare).map(WriteReply::Position)
            }
            WriteOp::Commit(commit) => {
                *records += 1;
                self.append_commit(commit).map(WriteReply::Position)
            }
            WriteOp::CompleteChunk => self.log.complete_chunk().map(WriteReply::Completed),
        }
    }

    fn current_version(&mut self, stream: &str) -> Result<StreamVersion> {
        if let Some(version) = self.versions.get(stream) {
            return Ok(*version);
        }
        let version = self.read_index.stream_version(stream)?;
        self.versions.put(stream.to_string(), version);
        Ok(version)
    }

    fn check_expected(&mut self, stream: &str, expected: ExpectedVersion) -> Result<StreamVersion> {
        let current = self.current_version(stream)?;
        if current == StreamVersion::Deleted {
            return Err(Error::StreamDeleted {
                stream: stream.to_string(),
            });
        }
        let ok = match expected {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == StreamVersion::NoStream,
            ExpectedVersion::Exact(n) => current == StreamVersion::At(n),
        };
        if !ok {
            return Err(Error::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }
        Ok(current)
    }

    fn write_events(
        &mut self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
        records: &mut u64,
    ) -> Result<WriteResult> {
        let current = self.check_expected(stream, expected)?;
        let first_event_number = match current {
            StreamVersion::At(n) => n + 1,
            _ => 0,
        };

        if events.is_empty() {
            return Ok(WriteResult {
                first_event_number,
                last_event_number: first_event_number - 1,
                prepare_positions: Vec::new(),
                commit_position: None,
                next_position: self.log.writer_position(),
            });
        }

        let timestamp = now_millis();
        let count = events.len();
        let prepares: Vec<PrepareRecord> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| {
                let mut flags = PrepareFlags::DATA;
                if i == 0 {
                    flags.insert(PrepareFlags::TRANSACTION_BEGIN);
                }
                if i == count - 1 {
                    flags.insert(PrepareFlags::TRANSACTION_END);
                }
                if event.is_json {
                    flags.insert(PrepareFlags::IS_JSON);
                }
                PrepareRecord {
                    transaction_position: 0,
                    transaction_offset: i as u32,
                    expected_version: expected.to_raw(),
                    flags,
                    timestamp,
                    event_id: event.event_id,
                    stream_id: stream.to_string(),
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                }
            })
            .collect();

        let commit = CommitRecord {
            transaction_position: 0,
            first_event_number,
            event_count: count as u32,
            timestamp,
        };

        let (prepare_positions, commit_position) = self.append_transaction(prepares, commit, records)?;
        let last_event_number = first_event_number + count as i32 - 1;
        self.versions.put(stream.to_string(), StreamVersion::At(last_event_number));

        debug!(stream, first_event_number, last_event_number, "Events written");
        Ok(WriteResult {
            first_event_number,
            last_event_number,
            prepare_positions,
            commit_position: Some(commit_position),
            next_position: self.log.writer_position(),
        })
    }

    fn delete_stream(&mut self, stream: &str, expected: ExpectedVersion, records: &mut u64) -> Result<WriteResult> {
        self.check_expected(stream, expected)?;

        let timestamp = now_millis();
        let tombstone = PrepareRecord {
            transaction_position: 0,
            transaction_offset: 0,
            expected_version: expected.to_raw(),
            flags: PrepareFlags::DELETE_TOMBSTONE
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
            timestamp,
            event_id: uuid::Uuid::new_v4(),
            stream_id: stream.to_string(),
            event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
            data: Default::default(),
            metadata: Default::default(),
        };
        let commit = CommitRecord {
            transaction_position: 0,
            first_event_number: DELETED_STREAM,
            event_count: 1,
            timestamp,
        };

        let (prepare_positions, commit_position) = self.append_transaction(vec![tombstone], commit, records)?;
        self.versions.put(stream.to_string(), StreamVersion::Deleted);

        info!(stream, "Stream deleted");
        Ok(WriteResult {
            first_event_number: DELETED_STREAM,
            last_event_number: DELETED_STREAM,
            prepare_positions,
            commit_position: Some(commit_position),
            next_position: self.log.writer_position(),
        })
    }

    /// Append prepares and their commit, keeping them in one chunk when
    /// they fit in one.
    fn append_transaction(
        &mut self,
        prepares: Vec<PrepareRecord>,
        mut commit: CommitRecord,
        records: &mut u64,
    ) -> Result<(Vec<u64>, u64)> {
        let prepare_lens: Vec<usize> = prepares
            .iter()
            .map(|p| frame_len(&LogRecord::Prepare(p.clone())))
            .collect();
        for &len in &prepare_lens {
            self.log.check_record_len(len)?;
        }
        let first_len = prepare_lens.first().copied().unwrap_or(0);
        let total_len = prepare_lens.iter().sum::<usize>() + frame_len(&LogRecord::Commit(commit));

        let transaction_position = self.log.reserve(total_len, first_len)?;
        let mut positions = Vec::with_capacity(prepares.len());
        for mut prepare in prepares {
            prepare.transaction_position = transaction_position;
            let position = self.log.append(&LogRecord::Prepare(prepare))?;
            if positions.is_empty() && position != transaction_position {
                return Err(Error::Internal {
                    message: format!(
                        "first prepare landed at {} instead of reserved {}",
                        position, transaction_position
                    ),
                });
            }
            positions.push(position);
            *records += 1;
        }

        commit.transaction_position = transaction_position;
        let commit_position = self.log.append(&LogRecord::Commit(commit))?;
        *records += 1;
        Ok((positions, commit_position))
    }

    fn append_prepare(&mut self, mut prepare: PrepareRecord) -> Result<u64> {
        if prepare.flags.contains(PrepareFlags::TRANSACTION_BEGIN) {
            let len = frame_len(&LogRecord::Prepare(prepare.clone()));
            prepare.transaction_position = self.log.reserve(len, len)?;
        }
        let transaction_position = prepare.transaction_position;
        let stream = prepare.stream_id.clone();

        let position = self.log.append(&LogRecord::Prepare(prepare))?;
        if position < transaction_position {
            return Err(Error::Internal {
                message: format!(
                    "prepare at {} precedes its transaction at {}",
                    position, transaction_position
                ),
            });
        }
        self.pending_transactions.insert(transaction_position, stream);
        Ok(position)
    }

    fn append_commit(&mut self, commit: CommitRecord) -> Result<u64> {
        let position = self.log.append(&LogRecord::Commit(commit))?;
        match self.pending_transactions.remove(&commit.transaction_position) {
            Some(stream) if commit.first_event_number == DELETED_STREAM => {
                self.versions.put(stream, StreamVersion::Deleted);
            }
            Some(stream) if commit.event_count > 0 => {
                let last = commit.first_event_number + commit.event_count as i32 - 1;
                self.versions.put(stream, StreamVersion::At(last));
            }
            Some(_) => {}
            None => {
                warn!(
                    transaction_position = commit.transaction_position,
                    "Commit for a transaction this writer did not start, dropping version cache"
                );
                self.versions.clear();
            }
        }
        Ok(position)
    }
}

/// Resolves with the reason once the chaser reports a failed pass. Never
/// resolves if the chaser is gone.
async fn chaser_failed(failures: &mut watch::Receiver<Option<String>>) -> String {
    let reason = failures
        .wait_for(Option::is_some)
        .await
        .map(|reason| (*reason).clone().unwrap_or_default());
    match reason {
        Ok(reason) => reason,
        Err(_) => std::future::pending().await,
    }
}

fn batch_failed(reason: &str) -> Error {
    Error::WriteError {
        message: format!("batch not persisted: {}", reason),
        source: None,
    }
}
