//! # Read Index
//!
//! Answers stream and log reads from chased state only.
//!
//! ```text
//!   read_event("acct-1", 3)
//!      │
//!      ├─▶ StreamInfoCache   last event number, deleted?
//!      ├─▶ TableIndex        candidate positions for (hash, 3)
//!      └─▶ ChunkLog          read prepare, compare stream id
//! ```
//!
//! A scavenge swap can move records while a read is in flight. Every read
//! runs against a log generation and is repeated if the generation changed
//! before it finished.

use std::sync::Arc;

use tracing::debug;

use chronicle_core::{
    error::{Error, Result},
    metrics::Metrics,
    utils::stream_hash,
    AllEventsSlice, LogRecord, PrepareRecord, ReadEventResult, ReadStreamResult, RecordedEvent,
    StreamSlice, StreamVersion, DELETED_STREAM,
};

use crate::cache::{StreamCacheInfo, StreamInfoCache};
use crate::checkpoint::Checkpoint;
use crate::chunk::ChunkLog;
use crate::memtable::IndexEntry;
use crate::table_index::TableIndex;

pub struct ReadIndex {
    log: Arc<ChunkLog>,
    index: Arc<TableIndex>,
    cache: Arc<StreamInfoCache>,
    chaser_checkpoint: Arc<Checkpoint>,
    metrics: Metrics,
}

impl ReadIndex {
    pub fn new(
        log: Arc<ChunkLog>,
        index: Arc<TableIndex>,
        cache: Arc<StreamInfoCache>,
        chaser_checkpoint: Arc<Checkpoint>,
        metrics: Metrics,
    ) -> Self {
        Self {
            log,
            index,
            cache,
            chaser_checkpoint,
            metrics,
        }
    }

    /// Read one event. `-1` reads the last event of the stream.
    pub fn read_event(&self, stream: &str, event_number: i32) -> Result<ReadEventResult> {
        self.metrics.record_read();
        self.with_stable_view(|| {
            let info = self.stream_info(stream)?;
            if info.is_deleted {
                return Ok(ReadEventResult::StreamDeleted);
            }
            let last = match info.last_event_number {
                Some(last) => last,
                None => return Ok(ReadEventResult::NoStream),
            };

            let number = if event_number == -1 { last } else { event_number };
            if number < 0 {
                return Ok(ReadEventResult::NotFound);
            }
            Ok(match self.resolve(stream, number)? {
                Some((position, prepare)) => {
                    ReadEventResult::Success(RecordedEvent::from_prepare(&prepare, number, position))
                }
                None => ReadEventResult::NotFound,
            })
        })
    }

    /// Up to `max_count` events starting at `from`, ascending.
    pub fn read_stream_events_forward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult> {
        self.metrics.record_read();
        self.with_stable_view(|| {
            let last = match self.readable_last(stream)? {
                Ok(last) => last,
                Err(result) => return Ok(result),
            };

            let from = from.max(0);
            if max_count == 0 || from > last {
                return Ok(ReadStreamResult::Success(StreamSlice {
                    events: Vec::new(),
                    next_event_number: if from > last { last + 1 } else { from },
                    last_event_number: last,
                    is_end_of_stream: from > last,
                }));
            }

            let count = max_count.min(i32::MAX as usize) as i32;
            let to = from.saturating_add(count - 1).min(last);
            let events = self.read_range(stream, from, to)?;

            Ok(ReadStreamResult::Success(StreamSlice {
                events,
                next_event_number: to + 1,
                last_event_number: last,
                is_end_of_stream: to >= last,
            }))
        })
    }

    /// Up to `max_count` events from `from` downwards. `-1` starts at the
    /// last event.
    pub fn read_stream_events_backward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult> {
        self.metrics.record_read();
        self.with_stable_view(|| {
            let last = match self.readable_last(stream)? {
                Ok(last) => last,
                Err(result) => return Ok(result),
            };

            let from = if from == -1 || from > last { last } else { from };
            if max_count == 0 || from < 0 {
                return Ok(ReadStreamResult::Success(StreamSlice {
                    events: Vec::new(),
                    next_event_number: from.max(-1),
                    last_event_number: last,
                    is_end_of_stream: from < 0,
                }));
            }

            let count = max_count.min(i32::MAX as usize) as i32;
            let to = from.saturating_sub(count - 1).max(0);
            let mut events = self.read_range(stream, to, from)?;
            events.reverse();

            Ok(ReadStreamResult::Success(StreamSlice {
                events,
                next_event_number: to - 1,
                last_event_number: last,
                is_end_of_stream: to == 0,
            }))
        })
    }

    /// Committed events in commit order, starting at log `position` and
    /// bounded by the chaser checkpoint.
    pub fn read_all_forward(&self, position: u64, max_count: usize) -> Result<AllEventsSlice> {
        self.metrics.record_read();
        self.with_stable_view(|| {
            let limit = self.chaser_checkpoint.read();
            let start = match self.log.read_sequential_from(position, limit).next() {
                Some(Err(Error::CorruptedChunk { .. })) => self.align(position, limit)?,
                _ => position,
            };

            let mut events = Vec::new();
            let mut reader = self.log.read_sequential_from(start, limit);
            let mut next_position = start;
            let mut filled = false;

            while !filled {
                let entry = match reader.next() {
                    Some(entry) => entry?,
                    None => {
                        next_position = reader.position();
                        break;
                    }
                };
                next_position = entry.next_position;

                if let LogRecord::Commit(commit) = &entry.record {
                    if commit.first_event_number == DELETED_STREAM {
                        continue;
                    }
                    let prepares =
                        self.log
                            .read_transaction(commit.transaction_position, entry.position, commit.event_count)?;
                    for (i, (prepare_position, prepare)) in prepares.iter().enumerate() {
                        if prepare.is_tombstone() {
                            continue;
                        }
                        events.push(RecordedEvent::from_prepare(
                            prepare,
                            commit.first_event_number + i as i32,
                            *prepare_position,
                        ));
                    }
                    filled = events.len() >= max_count;
                }
            }

            Ok(AllEventsSlice {
                events,
                next_position,
                is_end: next_position >= limit,
            })
        })
    }

    pub fn get_last_event_number(&self, stream: &str) -> Result<Option<i32>> {
        self.with_stable_view(|| Ok(self.stream_info(stream)?.last_event_number))
    }

    pub fn is_stream_deleted(&self, stream: &str) -> Result<bool> {
        self.with_stable_view(|| Ok(self.stream_info(stream)?.is_deleted))
    }

    /// Current version of `stream` as seen by the index.
    pub fn stream_version(&self, stream: &str) -> Result<StreamVersion> {
        self.with_stable_view(|| {
            let info = self.stream_info(stream)?;
            Ok(if info.is_deleted {
                StreamVersion::Deleted
            } else {
                match info.last_event_number {
                    Some(n) => StreamVersion::At(n),
                    None => StreamVersion::NoStream,
                }
            })
        })
    }

    /// Last event number of a live stream, or the read result to return
    /// instead.
    fn readable_last(&self, stream: &str) -> Result<std::result::Result<i32, ReadStreamResult>> {
        let info = self.stream_info(stream)?;
        if info.is_deleted {
            return Ok(Err(ReadStreamResult::StreamDeleted));
        }
        Ok(match info.last_event_number {
            Some(last) => Ok(last),
            None => Err(ReadStreamResult::NoStream),
        })
    }

    fn stream_info(&self, stream: &str) -> Result<StreamCacheInfo> {
        if let Some(info) = self.cache.get(stream) {
            return Ok(info);
        }

        let generation = self.cache.load_generation();
        let hash = stream_hash(stream);
        let is_deleted = self.resolve(stream, DELETED_STREAM)?.is_some();
        let last_event_number = if is_deleted { None } else { self.find_last(stream, hash)? };
        let info = StreamCacheInfo { last_event_number, is_deleted };

        self.cache.put_loaded(stream, info, generation);
        Ok(info)
    }

    fn find_last(&self, stream: &str, hash: u64) -> Result<Option<i32>> {
        let candidates = self.index.latest_candidates(hash);
        if let Some(number) = self.first_verified(stream, &candidates)? {
            return Ok(Some(number));
        }

        let mut all = self.index.range(hash, 0, DELETED_STREAM - 1);
        if all.is_empty() {
            return Ok(None);
        }
        debug!(stream, "Hash collision on last event lookup, scanning stream range");
        all.reverse();
        self.first_verified(stream, &all)
    }

    fn first_verified(&self, stream: &str, entries: &[IndexEntry]) -> Result<Option<i32>> {
        for entry in entries {
            if entry.event_number == DELETED_STREAM {
                continue;
            }
            if self.read_prepare(entry.position)?.is_some_and(|p| p.stream_id == stream) {
                return Ok(Some(entry.event_number));
            }
        }
        Ok(None)
    }

    /// Locate event `number` of `stream` among the hash candidates.
    fn resolve(&self, stream: &str, number: i32) -> Result<Option<(u64, PrepareRecord)>> {
        for position in self.index.get(stream_hash(stream), number) {
            if let Some(prepare) = self.read_prepare(position)? {
                if prepare.stream_id == stream {
                    return Ok(Some((position, prepare)));
                }
            }
        }
        Ok(None)
    }

    fn read_range(&self, stream: &str, from: i32, to: i32) -> Result<Vec<RecordedEvent>> {
        let mut events: Vec<RecordedEvent> = Vec::new();
        for entry in self.index.range(stream_hash(stream), from, to) {
            if events.last().is_some_and(|e| e.event_number == entry.event_number) {
                continue;
            }
            if let Some(prepare) = self.read_prepare(entry.position)? {
                if prepare.stream_id == stream {
                    events.push(RecordedEvent::from_prepare(&prepare, entry.event_number, entry.position));
                }
            }
        }
        Ok(events)
    }

    fn read_prepare(&self, position: u64) -> Result<Option<PrepareRecord>> {
        match self.log.read_at(position)? {
            LogRecord::Prepare(prepare) => Ok(Some(prepare)),
            LogRecord::Commit(_) => Ok(None),
        }
    }

    /// First record boundary at or after `position` in its chunk.
    fn align(&self, position: u64, limit: u64) -> Result<u64> {
        let chunk_start = position - position % self.log.chunk_size();
        let mut reader = self.log.read_sequential_from(chunk_start, limit);
        for entry in reader.by_ref() {
            let entry = entry?;
            if entry.position >= position {
                return Ok(entry.position);
            }
        }
        Ok(reader.position())
    }

    fn with_stable_view<T>(&self, mut read: impl FnMut() -> Result<T>) -> Result<T> {
        loop {
            let generation = self.log.generation();
            let result = read();
            if self.log.generation() == generation {
                return result;
            }
            self.metrics.record_read_retry();
            debug!("Log changed during read, retrying");
        }
    }
}
