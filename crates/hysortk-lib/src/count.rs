//! Run-length counting and frequency filtering
//!
//! A sorted task is scanned once. Runs of equal keys are merged into one
//! [`KmerCount`]: a raw seed weighs 1, a pre-aggregated entry weighs its
//! stored count. Counts saturate at `u32::MAX`.

use rayon::prelude::*;

use crate::comm::{CommError, Communicator};
use crate::dispatcher::TaskType;
use crate::kmer::{Kmer, KmerBits};
use crate::sort::SortedBatch;

/// Bytes of the count field of a serialized entry
const COUNT_BYTES: usize = 4;

/// A k-mer and its number of occurrences
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KmerCount<const K: usize>
where
    Kmer<K>: KmerBits,
{
    /// Canonical k-mer
    pub kmer: Kmer<K>,
    /// Occurrences over all reads of all ranks
    pub count: u32,
}

impl<const K: usize> KmerCount<K>
where
    Kmer<K>: KmerBits,
{
    /// Bytes of a serialized entry: the big-endian key, then the count
    pub const ENTRY_BYTES: usize = Kmer::<K>::BYTES + COUNT_BYTES;

    /// Pair `kmer` with `count`
    pub fn new(kmer: Kmer<K>, count: u32) -> Self {
        Self { kmer, count }
    }

    /// Serialize into the first [`Self::ENTRY_BYTES`] bytes of `out`
    ///
    /// The key comes first so entries sort by k-mer.
    pub fn write_entry(&self, out: &mut [u8]) {
        let key = Kmer::<K>::BYTES;
        self.kmer.write_key(&mut out[..key]);
        out[key..key + COUNT_BYTES].copy_from_slice(&self.count.to_le_bytes());
    }

    /// Inverse of [`write_entry`](Self::write_entry)
    pub fn from_entry(entry: &[u8]) -> Self {
        let key = Kmer::<K>::BYTES;
        let mut count = [0u8; COUNT_BYTES];
        count.copy_from_slice(&entry[key..key + COUNT_BYTES]);
        Self { kmer: Kmer::from_key(entry), count: u32::from_le_bytes(count) }
    }
}

/// Inclusive range of counts that survive filtering
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrequencyBand {
    /// Smallest accepted count
    pub lower: u32,
    /// Largest accepted count
    pub upper: u32,
}

impl FrequencyBand {
    /// Band accepting every count
    pub const UNFILTERED: Self = Self { lower: 1, upper: u32::MAX };

    /// Band accepting `lower..=upper`
    pub const fn new(lower: u32, upper: u32) -> Self {
        Self { lower, upper }
    }

    /// True if `count` is kept
    #[inline]
    pub fn contains(&self, count: u32) -> bool {
        self.lower <= count && count <= self.upper
    }
}

fn merge_runs<const K: usize>(
    records: &[u8],
    width: usize,
    band: FrequencyBand,
    weight: impl Fn(&[u8]) -> u32,
    out: &mut Vec<KmerCount<K>>,
) where
    Kmer<K>: KmerBits,
{
    let key_width = Kmer::<K>::BYTES;
    let mut iter = records.chunks_exact(width);
    let Some(first) = iter.next() else {
        return;
    };
    let mut run_key = &first[..key_width];
    let mut run_count = weight(first);

    for record in iter {
        let key = &record[..key_width];
        if key == run_key {
            run_count = run_count.saturating_add(weight(record));
        } else {
            if band.contains(run_count) {
                out.push(KmerCount::new(Kmer::from_key(run_key), run_count));
            }
            run_key = key;
            run_count = weight(record);
        }
    }
    if band.contains(run_count) {
        out.push(KmerCount::new(Kmer::from_key(run_key), run_count));
    }
}

/// Count runs of sorted seed keys, keeping the counts inside `band`
pub fn count_sorted_seeds<const K: usize>(keys: &[u8], band: FrequencyBand, out: &mut Vec<KmerCount<K>>)
where
    Kmer<K>: KmerBits,
{
    merge_runs(keys, Kmer::<K>::BYTES, band, |_| 1, out);
}

/// Merge sorted serialized entries, summing the counts of equal k-mers
pub fn count_sorted_entries<const K: usize>(entries: &[u8], band: FrequencyBand, out: &mut Vec<KmerCount<K>>)
where
    Kmer<K>: KmerBits,
{
    merge_runs(
        entries,
        KmerCount::<K>::ENTRY_BYTES,
        band,
        |entry| KmerCount::<K>::from_entry(entry).count,
        out,
    );
}

/// Count every sorted task in parallel and concatenate the results in task order
///
/// `types[i]` says whether `sorted[i]` holds seeds or entries.
pub fn count_tasks<const K: usize>(
    sorted: &[SortedBatch],
    types: &[TaskType],
    band: FrequencyBand,
) -> Vec<KmerCount<K>>
where
    Kmer<K>: KmerBits,
{
    debug_assert_eq!(sorted.len(), types.len());
    let per_task: Vec<Vec<KmerCount<K>>> = sorted
        .par_iter()
        .zip(types.par_iter())
        .map(|(batch, task_type)| {
            let mut out = Vec::new();
            match task_type {
                TaskType::Balanced => count_sorted_seeds(batch.records(), band, &mut out),
                TaskType::Unbalanced => count_sorted_entries(batch.records(), band, &mut out),
            }
            out
        })
        .collect();

    let total = per_task.iter().map(Vec::len).sum();
    let mut list = Vec::with_capacity(total);
    for part in per_task {
        list.extend(part);
    }
    list
}

/// Number of k-mers per count in `list`; index `c` holds the k-mers seen `c` times
pub fn local_histogram<const K: usize>(list: &[KmerCount<K>], len: usize) -> Vec<u64>
where
    Kmer<K>: KmerBits,
{
    let mut histogram = vec![0u64; len];
    let Some(last) = len.checked_sub(1) else {
        return histogram;
    };
    for entry in list {
        histogram[(entry.count as usize).min(last)] += 1;
    }
    histogram
}

/// Histogram of counts over the lists of every rank
///
/// Every rank returns the same vector, of length `min(max count, max_count) + 1`.
/// Counts above `max_count` land in the last slot.
///
/// # Errors
/// Returns an error if a collective fails.
pub fn kmer_histogram<const K: usize, C: Communicator + ?Sized>(
    list: &[KmerCount<K>],
    max_count: u32,
    comm: &C,
) -> Result<Vec<u64>, CommError>
where
    Kmer<K>: KmerBits,
{
    let local_max = list.iter().map(|e| e.count).max().unwrap_or(0);
    let max = comm.all_reduce_max_u64(u64::from(local_max.min(max_count)))?;
    let histogram = local_histogram(list, max as usize + 1);
    comm.all_reduce_sum_vec(&histogram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;

    fn keys_of<const K: usize>(kmers: &[&str]) -> Vec<u8>
    where
        Kmer<K>: KmerBits,
    {
        let mut out = vec![0u8; kmers.len() * Kmer::<K>::BYTES];
        for (chunk, s) in out.chunks_exact_mut(Kmer::<K>::BYTES).zip(kmers) {
            Kmer::<K>::from_str(s).unwrap().write_key(chunk);
        }
        out
    }

    #[test]
    fn test_entry_layout() {
        let entry = KmerCount::new(Kmer::<5>::from_str("ACGTT").unwrap(), 0x0102_0304);
        let mut bytes = vec![0u8; KmerCount::<5>::ENTRY_BYTES];
        entry.write_entry(&mut bytes);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[2..], &[4, 3, 2, 1]);
        assert_eq!(KmerCount::<5>::from_entry(&bytes), entry);
    }

    #[test]
    fn test_band_filters_runs() {
        // X appears n times and Y appears m times
        for (n, m) in [(1usize, 2usize), (2, 50), (50, 51), (3, 1), (60, 7)] {
            let mut seeds = vec!["AAAAC"; n];
            seeds.extend(std::iter::repeat("GGGTA").take(m));
            let keys = keys_of::<5>(&seeds);
            let mut out = Vec::new();
            count_sorted_seeds::<5>(&keys, FrequencyBand::new(2, 50), &mut out);

            let mut expected = Vec::new();
            for (s, c) in [("AAAAC", n), ("GGGTA", m)] {
                if (2..=50).contains(&c) {
                    expected.push(KmerCount::new(Kmer::<5>::from_str(s).unwrap(), c as u32));
                }
            }
            assert_eq!(out, expected, "n={n} m={m}");
        }
    }

    #[test]
    fn test_unfiltered_keeps_singletons() {
        let keys = keys_of::<4>(&["ACGT", "CCCC", "CCCC", "GTAC"]);
        let mut out = Vec::new();
        count_sorted_seeds::<4>(&keys, FrequencyBand::UNFILTERED, &mut out);
        let counts: Vec<u32> = out.iter().map(|e| e.count).collect();
        assert_eq!(counts, vec![1, 2, 1]);

        out.clear();
        count_sorted_seeds::<4>(&[], FrequencyBand::UNFILTERED, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_entries_sum_and_saturate() {
        let a = Kmer::<7>::from_str("ACGTACG").unwrap();
        let b = Kmer::<7>::from_str("TTTTTTG").unwrap();
        let width = KmerCount::<7>::ENTRY_BYTES;
        let entries = [
            KmerCount::new(a, 3),
            KmerCount::new(a, 4),
            KmerCount::new(b, u32::MAX - 1),
            KmerCount::new(b, 5),
        ];
        let mut bytes = vec![0u8; entries.len() * width];
        for (chunk, e) in bytes.chunks_exact_mut(width).zip(&entries) {
            e.write_entry(chunk);
        }

        let mut out = Vec::new();
        count_sorted_entries::<7>(&bytes, FrequencyBand::UNFILTERED, &mut out);
        assert_eq!(out, vec![KmerCount::new(a, 7), KmerCount::new(b, u32::MAX)]);

        out.clear();
        count_sorted_entries::<7>(&bytes, FrequencyBand::new(2, 50), &mut out);
        assert_eq!(out, vec![KmerCount::new(a, 7)]);
    }

    #[test]
    fn test_count_tasks_mixes_types() {
        let seeds = keys_of::<4>(&["AAAA", "AAAA", "ACCA"]);
        let mut entries = vec![0u8; KmerCount::<4>::ENTRY_BYTES];
        KmerCount::new(Kmer::<4>::from_str("GGGA").unwrap(), 9).write_entry(&mut entries);

        let sorted = vec![
            SortedBatch::unpadded(seeds, Kmer::<4>::BYTES),
            SortedBatch::unpadded(entries, KmerCount::<4>::ENTRY_BYTES),
        ];
        let list = count_tasks::<4>(&sorted, &[TaskType::Balanced, TaskType::Unbalanced], FrequencyBand::new(2, 50));
        assert_eq!(
            list,
            vec![
                KmerCount::new(Kmer::from_str("AAAA").unwrap(), 2),
                KmerCount::new(Kmer::from_str("GGGA").unwrap(), 9),
            ]
        );
    }

    #[test]
    fn test_histogram_across_ranks() {
        let histograms = LocalGroup::run(3, |comm| {
            let rank = comm.rank() as u32;
            let list: Vec<KmerCount<3>> = (0..=rank)
                .map(|i| KmerCount::new(Kmer::from_bits(i as u128), rank + 2))
                .collect();
            kmer_histogram(&list, u32::MAX, comm)
        });
        for histogram in histograms {
            assert_eq!(histogram.unwrap(), vec![0, 0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_histogram_folds_large_counts() {
        let histograms = LocalGroup::run(2, |comm| {
            let list: Vec<KmerCount<5>> = if comm.rank() == 0 {
                vec![
                    KmerCount::new(Kmer::from_bits(1), 2),
                    KmerCount::new(Kmer::from_bits(2), u32::MAX),
                ]
            } else {
                vec![KmerCount::new(Kmer::from_bits(3), 5), KmerCount::new(Kmer::from_bits(4), 4)]
            };
            kmer_histogram(&list, 4, comm)
        });
        for histogram in histograms {
            assert_eq!(histogram.unwrap(), vec![0, 0, 1, 0, 3]);
        }
    }
}
