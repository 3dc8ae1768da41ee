//! # Core Types
//!
//! Log records, event payloads and read results shared by every Chronicle
//! component.
//!
//! A write is two-phase in the log: one or more `Prepare` records carrying the
//! event payloads, followed by a `Commit` that assigns event numbers. Records
//! are addressed by their absolute logical position in the log.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Absolute logical position in the transaction log.
pub type LogPosition = u64;

/// Reserved event number marking a deleted stream (the tombstone's number).
pub const DELETED_STREAM: i32 = i32::MAX;

/// Event type written into a stream tombstone.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// Expected version of a stream supplied with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Skip the concurrency check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The last event in the stream must have this number.
    Exact(i32),
}

impl ExpectedVersion {
    pub const ANY: i32 = -2;
    pub const NO_STREAM: i32 = -1;

    /// Raw on-disk representation.
    pub fn to_raw(self) -> i32 {
        match self {
            ExpectedVersion::Any => Self::ANY,
            ExpectedVersion::NoStream => Self::NO_STREAM,
            ExpectedVersion::Exact(n) => n,
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            Self::ANY => ExpectedVersion::Any,
            Self::NO_STREAM => ExpectedVersion::NoStream,
            n => ExpectedVersion::Exact(n),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::Exact(n) => write!(f, "{}", n),
        }
    }
}

/// Bit flags stored on every prepare record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    pub const NONE: PrepareFlags = PrepareFlags(0);
    pub const DATA: PrepareFlags = PrepareFlags(0x01);
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x02);
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x04);
    pub const DELETE_TOMBSTONE: PrepareFlags = PrepareFlags(0x08);
    pub const IS_JSON: PrepareFlags = PrepareFlags(0x10);

    pub fn from_bits(bits: u16) -> Self {
        PrepareFlags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PrepareFlags) {
        self.0 |= other.0;
    }

    pub fn is_tombstone(self) -> bool {
        self.contains(PrepareFlags::DELETE_TOMBSTONE)
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | rhs.0)
    }
}

/// First phase of a write: one event payload awaiting its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    /// Position of the first prepare of the transaction.
    pub transaction_position: LogPosition,
    /// Index of this prepare within its transaction.
    pub transaction_offset: u32,
    /// Raw expected version (see [`ExpectedVersion::to_raw`]).
    pub expected_version: i32,
    pub flags: PrepareFlags,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub event_id: Uuid,
    pub stream_id: String,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl PrepareRecord {
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_tombstone()
    }
}

/// Second phase of a write: assigns event numbers to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    pub transaction_position: LogPosition,
    pub first_event_number: i32,
    pub event_count: u32,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// A record in the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Prepare(_) => RecordType::Prepare,
            LogRecord::Commit(_) => RecordType::Commit,
        }
    }

    pub fn transaction_position(&self) -> LogPosition {
        match self {
            LogRecord::Prepare(p) => p.transaction_position,
            LogRecord::Commit(c) => c.transaction_position,
        }
    }

    pub fn as_prepare(&self) -> Option<&PrepareRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            LogRecord::Commit(_) => None,
        }
    }
}

/// On-disk record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Prepare = 1,
    Commit = 2,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(RecordType::Prepare),
            2 => Ok(RecordType::Commit),
            other => Err(other),
        }
    }
}

/// Event payload submitted with a write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub is_json: bool,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
            is_json: false,
        }
    }

    pub fn json(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { is_json: true, ..Self::new(event_type, data) }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// A committed event as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_number: i32,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub is_json: bool,
    /// Position of the prepare carrying the payload.
    pub log_position: LogPosition,
    pub timestamp: i64,
}

impl RecordedEvent {
    pub fn from_prepare(prepare: &PrepareRecord, event_number: i32, log_position: LogPosition) -> Self {
        Self {
            stream_id: prepare.stream_id.clone(),
            event_number,
            event_id: prepare.event_id,
            event_type: prepare.event_type.clone(),
            data: prepare.data.clone(),
            metadata: prepare.metadata.clone(),
            is_json: prepare.flags.contains(PrepareFlags::IS_JSON),
            log_position,
            timestamp: prepare.timestamp,
        }
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub first_event_number: i32,
    pub last_event_number: i32,
    pub prepare_positions: Vec<LogPosition>,
    /// Position of the commit record, `None` when nothing was written.
    pub commit_position: Option<LogPosition>,
    /// Writer position right after this write.
    pub next_position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEventResult {
    Success(RecordedEvent),
    NotFound,
    NoStream,
    StreamDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStreamResult {
    Success(StreamSlice),
    NoStream,
    StreamDeleted,
}

/// A contiguous run of events from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    pub events: Vec<RecordedEvent>,
    /// Where the next read in the same direction should start.
    pub next_event_number: i32,
    pub last_event_number: i32,
    pub is_end_of_stream: bool,
}

/// Events from the whole log in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllEventsSlice {
    pub events: Vec<RecordedEvent>,
    pub next_position: LogPosition,
    pub is_end: bool,
}
