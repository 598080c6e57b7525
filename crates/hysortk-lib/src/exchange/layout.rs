//! Where an outgoing stream may be cut
//!
//! Chunks always end on a record boundary so that no record straddles two
//! rounds. A record larger than the budget is sent alone.

use std::collections::VecDeque;

/// Record structure of one outgoing stream
pub trait RecordLayout {
    /// Length of the next chunk: whole records, at most `budget` bytes
    /// unless the first record alone is larger, never more than `remaining`
    fn next_chunk_len(&mut self, remaining: usize, budget: usize) -> usize;
}

/// Records of `.0` bytes each
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedWidth(pub usize);

impl RecordLayout for FixedWidth {
    fn next_chunk_len(&mut self, remaining: usize, budget: usize) -> usize {
        let width = self.0.max(1);
        let records = (budget / width).max(1);
        (records * width).min(remaining)
    }
}

/// Records of known, varying sizes, consumed in order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordQueue {
    sizes: VecDeque<usize>,
}

impl RecordQueue {
    /// Queue of record sizes in stream order
    pub fn new(sizes: impl IntoIterator<Item = usize>) -> Self {
        Self { sizes: sizes.into_iter().collect() }
    }

    /// Append records
    pub fn extend(&mut self, sizes: impl IntoIterator<Item = usize>) {
        self.sizes.extend(sizes);
    }

    /// Records not yet handed out
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// True if every record was handed out
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

impl RecordLayout for RecordQueue {
    fn next_chunk_len(&mut self, remaining: usize, budget: usize) -> usize {
        let mut len = 0;
        while let Some(&size) = self.sizes.front() {
            if len > 0 && len + size > budget {
                break;
            }
            if len + size > remaining {
                break;
            }
            len += size;
            self.sizes.pop_front();
        }
        // sizes that do not describe the stream: fall back to raw bytes
        if len == 0 {
            len = budget.max(1).min(remaining);
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_rounds_down() {
        let mut layout = FixedWidth(4);
        assert_eq!(layout.next_chunk_len(100, 10), 8);
        assert_eq!(layout.next_chunk_len(100, 3), 4);
        assert_eq!(layout.next_chunk_len(6, 100), 6);
        assert_eq!(layout.next_chunk_len(0, 100), 0);
    }

    #[test]
    fn test_record_queue_keeps_records_whole() {
        let mut layout = RecordQueue::new([3, 5, 2, 9, 1]);
        let mut remaining = 20;
        let mut chunks = Vec::new();
        while remaining > 0 {
            let len = layout.next_chunk_len(remaining, 8);
            chunks.push(len);
            remaining -= len;
        }
        assert_eq!(chunks, vec![8, 2, 9, 1]);
        assert!(layout.is_empty());
    }

    #[test]
    fn test_record_queue_without_sizes() {
        let mut layout = RecordQueue::default();
        assert_eq!(layout.next_chunk_len(10, 4), 4);
        layout.extend([2, 2]);
        assert_eq!(layout.len(), 2);
        assert_eq!(layout.next_chunk_len(4, 16), 4);
    }
}
