//! Bounded top-N record retention.
//!
//! Records (for example slowest-request samples) are kept per entity in
//! a small buffer that only competes entries against each other within
//! one time bucket: once the bucket moves on, new entries are appended
//! unconditionally and the consumer is expected to drain soon after.

use std::collections::BTreeMap;

use super::value::FieldValue;

/// One retained record sample.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    /// Minute bucket the sample was observed in.
    pub time_bucket: u64,
    /// Ranking key, higher outranks lower (e.g. latency in ms).
    pub rank: i64,
    /// Full storage row for the sample.
    pub fields: BTreeMap<String, FieldValue>,
}

/// Keeps at most `capacity` entries per time bucket, evicting the
/// current minimum only when a newcomer strictly outranks it.
/// Competition inserts land in rank order behind equal ranks; entries
/// accepted below capacity keep arrival order.
#[derive(Debug)]
pub struct BoundedRecentBuffer {
    capacity: usize,
    entries: Vec<RecordEntry>,
}

impl BoundedRecentBuffer {
    /// `capacity` must be at least one; config validation enforces it.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Vec::with_capacity(capacity) }
    }

    /// Offers an entry. Entries from a later bucket than the buffer
    /// head bypass the capacity check entirely.
    pub fn accept(&mut self, entry: RecordEntry) {
        let head_bucket = self.entries.first().map(|e| e.time_bucket);
        if self.entries.len() < self.capacity || head_bucket != Some(entry.time_bucket) {
            self.entries.push(entry);
            return;
        }

        // Full and same bucket: the newcomer must strictly outrank the
        // current minimum (first minimal entry in arrival order).
        let mut min_index = 0;
        for (i, existing) in self.entries.iter().enumerate() {
            if existing.rank < self.entries[min_index].rank {
                min_index = i;
            }
        }
        if entry.rank <= self.entries[min_index].rank {
            return;
        }
        self.entries.remove(min_index);
        let position = self
            .entries
            .iter()
            .position(|existing| entry.rank < existing.rank)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
    }

    /// Takes all retained entries, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<RecordEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn entries(&self) -> &[RecordEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bucket: u64, rank: i64) -> RecordEntry {
        RecordEntry { time_bucket: bucket, rank, fields: BTreeMap::new() }
    }

    fn ranks(buffer: &BoundedRecentBuffer) -> Vec<i64> {
        buffer.entries().iter().map(|e| e.rank).collect()
    }

    #[test]
    fn same_bucket_competition_then_cross_bucket_append() {
        let mut buffer = BoundedRecentBuffer::new(5);
        for rank in [1, 3, 5, 7, 9] {
            buffer.accept(entry(202401171200, rank));
        }
        // Full buffer: 4 outranks the minimum 1, lands in sorted position.
        buffer.accept(entry(202401171200, 4));
        assert_eq!(ranks(&buffer), vec![3, 4, 5, 7, 9]);

        // A later bucket bypasses capacity entirely.
        buffer.accept(entry(202401171201, 4));
        assert_eq!(ranks(&buffer), vec![3, 4, 5, 7, 9, 4]);
    }

    #[test]
    fn newcomer_tying_the_minimum_is_rejected() {
        let mut buffer = BoundedRecentBuffer::new(3);
        for rank in [4, 5, 6] {
            buffer.accept(entry(1, rank));
        }
        buffer.accept(entry(1, 4));
        assert_eq!(ranks(&buffer), vec![4, 5, 6]);
        buffer.accept(entry(1, 3));
        assert_eq!(ranks(&buffer), vec![4, 5, 6]);
    }

    #[test]
    fn tied_insert_lands_after_equal_entries() {
        let mut buffer = BoundedRecentBuffer::new(5);
        let mut first_five = entry(1, 5);
        first_five.fields.insert("order".into(), FieldValue::Long(1));
        for e in [entry(1, 3), first_five, entry(1, 7), entry(1, 9), entry(1, 11)] {
            buffer.accept(e);
        }
        let mut second_five = entry(1, 5);
        second_five.fields.insert("order".into(), FieldValue::Long(2));
        buffer.accept(second_five);

        assert_eq!(ranks(&buffer), vec![5, 5, 7, 9, 11]);
        let orders: Vec<_> = buffer
            .entries()
            .iter()
            .filter(|e| e.rank == 5)
            .map(|e| e.fields.get("order").and_then(FieldValue::as_long))
            .collect();
        assert_eq!(orders, vec![Some(1), Some(2)]);
    }

    #[test]
    fn under_capacity_appends_without_competition() {
        let mut buffer = BoundedRecentBuffer::new(4);
        buffer.accept(entry(1, 9));
        buffer.accept(entry(1, 2));
        assert_eq!(ranks(&buffer), vec![9, 2]);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut buffer = BoundedRecentBuffer::new(2);
        buffer.accept(entry(1, 1));
        buffer.accept(entry(1, 2));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
        // The buffer is reusable after a drain.
        buffer.accept(entry(2, 5));
        assert_eq!(buffer.len(), 1);
    }
}
