//! Read sources
//!
//! The counting pipeline never sees text: it reads 2-bit codes through the
//! [`ReadSource`] trait. [`DnaBuffer`] is the in-memory implementation,
//! filled from ASCII sequences or from FASTA/FASTQ files (gzip handled by
//! needletail). Any non-ACGT character ends the current read and starts a
//! new one, so `N` runs never produce k-mers.

use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result};
use needletail::parse_fastx_file;

use crate::encoding::encode_base;

/// Read-only, indexable collection of encoded reads
pub trait ReadSource: Sync {
    /// Number of reads
    fn count(&self) -> usize;

    /// Length in bases of read `index`
    fn length(&self, index: usize) -> usize {
        self.symbols(index).len()
    }

    /// The 2-bit codes of read `index`, one code per byte
    fn symbols(&self, index: usize) -> &[u8];

    /// Total number of bases over all reads
    fn total_bases(&self) -> usize {
        (0..self.count()).map(|i| self.length(i)).sum()
    }
}

/// Concatenated 2-bit code buffer with per-read offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnaBuffer {
    codes: Vec<u8>,
    offsets: Vec<usize>,
}

impl DnaBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self { codes: Vec::new(), offsets: vec![0] }
    }

    /// Append an ASCII sequence, splitting it at every non-ACGT byte
    ///
    /// Returns the number of reads added. Empty fragments are dropped.
    pub fn push_ascii(&mut self, sequence: &[u8]) -> usize {
        if self.offsets.is_empty() {
            self.offsets.push(0);
        }
        let before = self.count();
        for &base in sequence {
            match encode_base(base) {
                Ok(code) => self.codes.push(code),
                Err(_) => self.close_read(),
            }
        }
        self.close_read();
        self.count() - before
    }

    /// Append a read given as 2-bit codes
    pub fn push_codes(&mut self, codes: &[u8]) {
        if self.offsets.is_empty() {
            self.offsets.push(0);
        }
        self.codes.extend(codes.iter().map(|c| c & 0b11));
        self.close_read();
    }

    fn close_read(&mut self) {
        let end = self.codes.len();
        if self.offsets.last().is_some_and(|&last| last < end) {
            self.offsets.push(end);
        }
    }

    /// Build a buffer from ASCII sequences
    pub fn from_sequences<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut buffer = Self::new();
        for seq in sequences {
            buffer.push_ascii(seq.as_ref());
        }
        buffer
    }

    /// Load every record of a FASTA/FASTQ file (may be gzipped)
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or a record is malformed
    pub fn from_fastx<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = parse_fastx_file(path)
            .with_context(|| format!("Failed to open sequence file: {}", path.display()))?;

        let mut buffer = Self::new();
        while let Some(record) = reader.next() {
            let record = record
                .with_context(|| format!("Failed to parse sequence record in {}", path.display()))?;
            buffer.push_ascii(&record.seq());
        }
        Ok(buffer)
    }

    /// Range of reads owned by `part` when splitting into `parts` contiguous blocks
    pub fn block_range(&self, part: usize, parts: usize) -> Range<usize> {
        block_range(self.count(), part, parts)
    }

    /// Copy reads `range` into a new buffer
    pub fn slice(&self, range: Range<usize>) -> Self {
        let mut out = Self::new();
        for i in range {
            out.push_codes(self.symbols(i));
        }
        out
    }

    /// Split into `parts` contiguous blocks of reads, one per process
    pub fn partition(&self, parts: usize) -> Vec<Self> {
        (0..parts).map(|p| self.slice(self.block_range(p, parts))).collect()
    }
}

impl ReadSource for DnaBuffer {
    fn count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    fn length(&self, index: usize) -> usize {
        self.offsets[index + 1] - self.offsets[index]
    }

    fn symbols(&self, index: usize) -> &[u8] {
        &self.codes[self.offsets[index]..self.offsets[index + 1]]
    }

    fn total_bases(&self) -> usize {
        self.codes.len()
    }
}

/// Contiguous block `part` of `0..len` split into `parts` near-equal pieces
///
/// The first `len % parts` blocks get one extra element.
pub fn block_range(len: usize, part: usize, parts: usize) -> Range<usize> {
    let parts = parts.max(1);
    let base = len / parts;
    let extra = len % parts;
    let start = part * base + part.min(extra);
    let end = start + base + usize::from(part < extra);
    start.min(len)..end.min(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_push_ascii_splits_on_invalid() {
        let mut buffer = DnaBuffer::new();
        assert_eq!(buffer.push_ascii(b"ACGTNNGGAXT"), 3);
        assert_eq!(buffer.count(), 3);
        assert_eq!(buffer.symbols(0), &[0b00, 0b01, 0b11, 0b10]);
        assert_eq!(buffer.length(1), 3);
        assert_eq!(buffer.symbols(2), &[0b10]);
        assert_eq!(buffer.total_bases(), 8);
    }

    #[test]
    fn test_empty_sequences_are_dropped() {
        let buffer = DnaBuffer::from_sequences(["", "NNN", "AC"]);
        assert_eq!(buffer.count(), 1);
        assert_eq!(buffer.length(0), 2);
        assert_eq!(DnaBuffer::default().count(), 0);
    }

    #[test]
    fn test_block_range_covers_everything() {
        let ranges: Vec<_> = (0..3).map(|p| block_range(10, p, 3)).collect();
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(block_range(2, 3, 4), 2..2);
    }

    #[test]
    fn test_partition_preserves_reads() {
        let buffer = DnaBuffer::from_sequences(["ACGT", "GG", "TTTAC", "CA", "G"]);
        let parts = buffer.partition(2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].count() + parts[1].count(), buffer.count());
        assert_eq!(parts[0].symbols(0), buffer.symbols(0));
        assert_eq!(parts[1].symbols(parts[1].count() - 1), buffer.symbols(4));
    }

    #[test]
    fn test_from_fastx() -> Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        writeln!(temp_file, ">seq1")?;
        writeln!(temp_file, "ACGTACGT")?;
        writeln!(temp_file, ">seq2")?;
        writeln!(temp_file, "TTGNNCA")?;
        temp_file.flush()?;

        let buffer = DnaBuffer::from_fastx(temp_file.path())?;
        assert_eq!(buffer.count(), 3);
        assert_eq!(buffer.length(0), 8);
        assert_eq!(buffer.length(1), 3);
        assert_eq!(buffer.length(2), 2);
        Ok(())
    }
}
