//! # Chronicle Storage
//!
//! Storage core of a single event-store node: a chunked transaction log,
//! a tiered on-disk index, a chaser that makes commits visible and an online
//! scavenger.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  append ──> Writer ──> ChunkLog ──> fsync ──> writer.chk    │
//! │                                                   │         │
//! │                                                   ▼         │
//! │              chaser.chk <── TableIndex <── Chaser           │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  Query ──> StreamInfoCache ──> TableIndex ──> ChunkLog      │
//! │                                  │                          │
//! │                                  ▼                          │
//! │                   MemTable, then PTables by level           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod chaser;
pub mod checkpoint;
pub mod chunk;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod ptable;
pub mod read_index;
pub mod scavenger;
pub mod table_index;
pub mod writer;

pub use cache::{CacheStats, StreamCacheInfo, StreamInfoCache};
pub use chaser::{Chaser, ChaserState};
pub use checkpoint::Checkpoint;
pub use chunk::{ChunkInfo, ChunkLog, LogEntry, SequentialReader};
pub use compaction::{LevelMergePolicy, MergePolicy, RelocationMap};
pub use engine::StorageEngine;
pub use manifest::IndexManifest;
pub use memtable::{IndexEntry, MemTable};
pub use ptable::{PTable, PTableInfo};
pub use read_index::ReadIndex;
pub use scavenger::{ScavengeResult, Scavenger};
pub use table_index::{IndexStats, TableIndex};
pub use writer::Writer;
