use chronicle_core::{error::Result, LogRecord};

use super::{ChunkLog, NextRecord};

/// A record read from the log together with where it starts and ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub position: u64,
    pub record: LogRecord,
    /// Position right after this record.
    pub next_position: u64,
}

/// Lazy forward scan over the log, bounded by `limit`.
///
/// Crosses chunk boundaries transparently. After an error the iterator is
/// fused.
pub struct SequentialReader<'a> {
    log: &'a ChunkLog,
    position: u64,
    limit: u64,
}

impl<'a> SequentialReader<'a> {
    pub(crate) fn new(log: &'a ChunkLog, position: u64, limit: u64) -> Self {
        Self { log, position, limit }
    }

    /// Where the next record would be read from.
    ///
    /// Once the scan reaches the end of a completed chunk this already points
    /// at the start of the following chunk.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for SequentialReader<'_> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.position >= self.limit {
                return None;
            }

            match self.log.read_next(self.position) {
                Ok(NextRecord::Record { record, len }) => {
                    let entry = LogEntry {
                        position: self.position,
                        record,
                        next_position: self.position + len as u64,
                    };
                    self.position = entry.next_position;
                    return Some(Ok(entry));
                }
                Ok(NextRecord::ChunkEnd { next_chunk_start }) => {
                    self.position = next_chunk_start.min(self.limit);
                }
                Ok(NextRecord::End) => return None,
                Err(e) => {
                    self.limit = self.position;
                    return Some(Err(e));
                }
            }
        }
    }
}
