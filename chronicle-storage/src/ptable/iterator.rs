use super::PTable;
use crate::memtable::IndexEntry;

/// Forward iterator over a PTable's entries.
pub struct PTableIterator<'a> {
    table: &'a PTable,
    index: usize,
}

impl<'a> PTableIterator<'a> {
    pub(crate) fn new(table: &'a PTable) -> Self {
        Self { table, index: 0 }
    }
}

impl Iterator for PTableIterator<'_> {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        if self.index >= self.table.len() {
            return None;
        }
        let entry = self.table.entry_at(self.index);
        self.index += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.table.len() - self.index;
        (remaining, Some(remaining))
    }
}
