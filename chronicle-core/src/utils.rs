//! # Common Utilities
//!
//! Hashing, formatting and time helpers used throughout Chronicle.

use xxhash_rust::xxh3::xxh3_64;

/// Hash of a stream name as stored in index entries.
///
/// Different streams can share a hash; index lookups always verify the
/// stream name against the record they resolve to.
pub fn stream_hash(stream_id: &str) -> u64 {
    xxh3_64(stream_id.as_bytes())
}

/// Current wall clock time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Byte count with a binary unit for log lines, e.g. `1.5 KiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
