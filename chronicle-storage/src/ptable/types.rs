use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::memtable::IndexEntry;

pub const PTABLE_MAGIC: &[u8; 8] = b"CHRNPTBL";
pub const PTABLE_VERSION: u32 = 1;
pub const PTABLE_HEADER_SIZE: usize = 32;
pub const PTABLE_ENTRY_SIZE: usize = 20;
pub const PTABLE_EXTENSION: &str = "idx";

pub fn ptable_file_name(id: u64) -> String {
    format!("ptable-{:010}.{}", id, PTABLE_EXTENSION)
}

/// Manifest record of one PTable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PTableInfo {
    pub id: u64,
    pub level: u32,
    pub file_name: String,
    pub entry_count: u64,
}

pub(crate) fn encode_entry(entry: &IndexEntry, buf: &mut [u8; PTABLE_ENTRY_SIZE]) {
    LittleEndian::write_u64(&mut buf[0..8], entry.stream_hash);
    LittleEndian::write_i32(&mut buf[8..12], entry.event_number);
    LittleEndian::write_u64(&mut buf[12..20], entry.position);
}

pub(crate) fn decode_entry(buf: &[u8]) -> IndexEntry {
    IndexEntry {
        stream_hash: LittleEndian::read_u64(&buf[0..8]),
        event_number: LittleEndian::read_i32(&buf[8..12]),
        position: LittleEndian::read_u64(&buf[12..20]),
    }
}
