//! # Core Traits
//!
//! The API the storage core offers to its external collaborators: request
//! management, client protocols and the stats/scavenge message handlers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;
use crate::types::{
    AllEventsSlice, ExpectedVersion, LogPosition, NewEvent, ReadEventResult, ReadStreamResult,
    WriteResult,
};
use crate::Result;

/// Event store trait
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream; resolves once the commit is visible to reads.
    async fn append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteResult>;

    /// Write a tombstone for the stream.
    async fn delete_stream(&self, stream: &str, expected_version: ExpectedVersion) -> Result<WriteResult>;

    /// Read one event; `-1` reads the last event.
    async fn read_event(&self, stream: &str, event_number: i32) -> Result<ReadEventResult>;

    async fn read_stream_forward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult>;

    /// Read backwards from `from`; `-1` starts at the last event.
    async fn read_stream_backward(&self, stream: &str, from: i32, max_count: usize) -> Result<ReadStreamResult>;

    async fn read_all_forward(&self, position: LogPosition, max_count: usize) -> Result<AllEventsSlice>;

    /// Kick off a scavenge pass in the background.
    fn start_scavenge(&self) -> ScavengeStatus;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats>;
}

/// Reply to a scavenge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScavengeStatus {
    Started,
    AlreadyRunning,
}

/// Storage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub writer_checkpoint: LogPosition,
    pub chaser_checkpoint: LogPosition,
    pub chaser_state: String,
    pub chunk_count: usize,
    pub completed_chunks: usize,
    pub memtable_entries: usize,
    pub index_entries: u64,
    /// PTable count per level.
    pub index_levels: BTreeMap<u32, usize>,
    pub index_persisted_position: LogPosition,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub scavenge_running: bool,
    pub metrics: MetricsSnapshot,
}
