//! Persisted index tables.
//!
//! PTable File Layout
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (32 bytes)                                          │
//! │    Magic "CHRNPTBL" (8) | Version (4) | Level (4)           │
//! │    Entry Count (8) | Entries CRC32 (4) | Reserved (4)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Entries, sorted by (stream hash, event number, position)   │
//! │    Stream Hash (8) | Event Number (4) | Log Position (8)     │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Tables are written once and never modified. Lookups binary search the
//! memory-mapped entry array.

mod iterator;
mod reader;
mod types;
mod writer;

pub use iterator::PTableIterator;
pub use reader::PTable;
pub use types::{ptable_file_name, PTableInfo, PTABLE_ENTRY_SIZE, PTABLE_HEADER_SIZE};
pub use writer::{write_ptable, PTableWriter};
