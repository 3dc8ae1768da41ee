//! # MemTable - In-Memory Index Buffer
//!
//! Holds the most recent index entries before they are flushed to a level-0
//! PTable. Backed by a concurrent skip list so the chaser can insert while
//! readers scan without locks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        MemTable                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Chaser ──add()──> SkipMap<(hash, number, position)>        │
//! │                               │                             │
//! │                               ▼                             │
//! │                     entry count reached?                    │
//! │                               │ yes                         │
//! │                               ▼                             │
//! │              flush to level-0 PTable, swap empty            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A flushed memtable is never mutated again; readers holding it keep a
//! consistent view until they drop it.

mod table;
mod types;

pub use table::MemTable;
pub use types::{IndexEntry, MemTableStats};
