//! Aligned LSD radix sort
//!
//! One stable counting pass per key byte, least significant first,
//! alternating between the data and a scratch buffer of the same size.
//! Each pass builds per-chunk histograms in parallel, turns them into
//! per-chunk write offsets, then scatters every chunk in parallel into
//! disjoint slots of the destination. Passes where every record shares the
//! byte are skipped.

use std::marker::PhantomData;

use rayon::prelude::*;

use super::SortError;

/// Smallest chunk handed to one scatter job
const MIN_CHUNK_RECORDS: usize = 4096;

/// Sort `width`-byte records of `data` by their first `key_width` bytes
///
/// Both `data` and `scratch` must start on an `alignment` boundary and
/// `scratch` must hold at least `data.len()` bytes. Runs on the current
/// rayon pool.
///
/// # Errors
/// Returns an error if a buffer is misaligned, the scratch is too small,
/// or `data` is not a whole number of records.
pub fn aligned_radix_sort(
    data: &mut [u8],
    scratch: &mut [u8],
    width: usize,
    key_width: usize,
    alignment: usize,
) -> Result<(), SortError> {
    if width == 0 || data.len() % width != 0 {
        return Err(SortError::RaggedBuffer { len: data.len(), width });
    }
    for addr in [data.as_ptr() as usize, scratch.as_ptr() as usize] {
        if data.len() > 0 && addr % alignment != 0 {
            return Err(SortError::Misaligned { addr, alignment });
        }
    }
    if scratch.len() < data.len() {
        return Err(SortError::ScratchTooSmall { needed: data.len(), actual: scratch.len() });
    }

    let n = data.len() / width;
    if n < 2 {
        return Ok(());
    }
    let scratch = &mut scratch[..data.len()];
    let chunk_records = n
        .div_ceil(rayon::current_num_threads() * 4)
        .max(MIN_CHUNK_RECORDS);
    let chunk_bytes = chunk_records * width;

    let mut in_data = true;
    for byte in (0..key_width.min(width)).rev() {
        let moved = if in_data {
            scatter_pass(data, scratch, width, byte, chunk_bytes)
        } else {
            scatter_pass(scratch, data, width, byte, chunk_bytes)
        };
        if moved {
            in_data = !in_data;
        }
    }
    if !in_data {
        data.copy_from_slice(scratch);
    }
    Ok(())
}

/// Stable scatter of `src` into `dst` on key byte `byte`
///
/// Returns false (and leaves `dst` untouched) when all records share the byte.
fn scatter_pass(src: &[u8], dst: &mut [u8], width: usize, byte: usize, chunk_bytes: usize) -> bool {
    let n = src.len() / width;
    let histograms: Vec<[usize; 256]> = src
        .par_chunks(chunk_bytes)
        .map(|chunk| {
            let mut hist = [0usize; 256];
            for record in chunk.chunks_exact(width) {
                hist[record[byte] as usize] += 1;
            }
            hist
        })
        .collect();

    let mut totals = [0usize; 256];
    for hist in &histograms {
        for (total, &count) in totals.iter_mut().zip(hist.iter()) {
            *total += count;
        }
    }
    if totals.iter().any(|&t| t == n) {
        return false;
    }

    // chunk c writes bucket b starting after all earlier buckets and after
    // chunks before c in bucket b
    let mut offsets = histograms;
    let mut next = 0;
    for bucket in 0..256 {
        for hist in offsets.iter_mut() {
            let count = hist[bucket];
            hist[bucket] = next;
            next += count;
        }
    }

    let out = ScatterTarget::new(dst);
    src.par_chunks(chunk_bytes)
        .zip(offsets.into_par_iter())
        .for_each(|(chunk, mut slots)| {
            for record in chunk.chunks_exact(width) {
                let bucket = record[byte] as usize;
                // SAFETY: the offsets give every record of every chunk its
                // own slot, so no two jobs write the same bytes
                unsafe { out.write(slots[bucket] * width, record) };
                slots[bucket] += 1;
            }
        });
    true
}

/// Destination buffer shared by the scatter jobs
struct ScatterTarget<'a> {
    ptr: *mut u8,
    len: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

// SAFETY: jobs only write through `write`, into disjoint ranges
unsafe impl Send for ScatterTarget<'_> {}
unsafe impl Sync for ScatterTarget<'_> {}

impl<'a> ScatterTarget<'a> {
    fn new(dst: &'a mut [u8]) -> Self {
        Self { ptr: dst.as_mut_ptr(), len: dst.len(), _buffer: PhantomData }
    }

    /// # Safety
    /// No other job may write `offset..offset + record.len()` concurrently.
    #[inline]
    unsafe fn write(&self, offset: usize, record: &[u8]) {
        assert!(offset + record.len() <= self.len);
        // SAFETY: in bounds by the assert, exclusive by the caller's contract
        unsafe { std::ptr::copy_nonoverlapping(record.as_ptr(), self.ptr.add(offset), record.len()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SORT_ALIGNMENT;
    use crate::sort::test_util::{keys, random_records, reference_sort};
    use crate::sort::{is_sorted, AlignedRecords, ScratchBuffer};

    fn sort_aligned(data: Vec<u8>, width: usize, key_width: usize) -> Vec<u8> {
        let mut aligned = AlignedRecords::new(data, width, SORT_ALIGNMENT).unwrap();
        let mut scratch = ScratchBuffer::zeroed(aligned.window_bytes(), SORT_ALIGNMENT);
        aligned_radix_sort(aligned.window_mut(), scratch.as_mut_slice(), width, key_width, SORT_ALIGNMENT)
            .unwrap();
        aligned.into_sorted().records().to_vec()
    }

    #[test]
    fn test_sorts_like_reference() {
        for (n, width, key_width) in [(300, 1, 1), (1000, 3, 3), (20_000, 8, 8), (9000, 13, 9)] {
            let data = random_records(n, width, 5);
            let expected = reference_sort(&data, width, key_width);
            let sorted = sort_aligned(data, width, key_width);

            assert!(is_sorted(&sorted, width, key_width));
            let expected_keys: Vec<Vec<u8>> =
                expected.iter().map(|r| r[..key_width].to_vec()).collect();
            assert_eq!(keys(&sorted, width, key_width), expected_keys);
        }
    }

    #[test]
    fn test_stable_on_key() {
        // key byte, then the record's input position as a big-endian u16
        let n = 5000u16;
        let width = 3;
        let mut data = ScratchBuffer::zeroed(n as usize * width, SORT_ALIGNMENT);
        for (i, record) in data.as_mut_slice().chunks_exact_mut(width).enumerate() {
            let [hi, lo] = (i as u16).to_be_bytes();
            record.copy_from_slice(&[(i * 7 % 5) as u8, hi, lo]);
        }
        let mut scratch = ScratchBuffer::zeroed(n as usize * width, SORT_ALIGNMENT);
        aligned_radix_sort(data.as_mut_slice(), scratch.as_mut_slice(), width, 1, SORT_ALIGNMENT).unwrap();

        let sorted = data.as_mut_slice();
        assert!(is_sorted(sorted, width, 1));
        let records: Vec<&[u8]> = sorted.chunks_exact(width).collect();
        for run in records.chunk_by(|a, b| a[0] == b[0]) {
            let positions: Vec<u16> = run.iter().map(|r| u16::from_be_bytes([r[1], r[2]])).collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "run of key {} reordered", run[0][0]);
        }
        assert_eq!(records.chunk_by(|a, b| a[0] == b[0]).count(), 5);
    }

    #[test]
    fn test_rejects_misaligned_input() {
        let mut scratch = ScratchBuffer::zeroed(64, SORT_ALIGNMENT);
        let mut backing = ScratchBuffer::zeroed(80, SORT_ALIGNMENT);
        let data = &mut backing.as_mut_slice()[8..72];
        let err = aligned_radix_sort(data, scratch.as_mut_slice(), 8, 8, SORT_ALIGNMENT).unwrap_err();
        assert!(matches!(err, SortError::Misaligned { .. }));
    }

    #[test]
    fn test_rejects_short_scratch() {
        let mut data = ScratchBuffer::zeroed(64, SORT_ALIGNMENT);
        let mut scratch = ScratchBuffer::zeroed(32, SORT_ALIGNMENT);
        let err = aligned_radix_sort(data.as_mut_slice(), scratch.as_mut_slice(), 8, 8, SORT_ALIGNMENT)
            .unwrap_err();
        assert!(matches!(err, SortError::ScratchTooSmall { needed: 64, actual: 32 }));
    }
}
