//! Supermer encoding and decoding
//!
//! A supermer is a maximal run of consecutive k-mer windows of one read that
//! share a destination task, capped so the run spans at most
//! `max_len` bases. It is stored as its length in bases plus the bases
//! themselves packed four per byte, which replaces `n` k-mer records with
//! a single `n + k - 1` base record.
//!
//! Encoding happens in two passes over the destination sequences: a
//! [`SupermerTally`] sizes every per-task buffer, then the
//! [`SupermerEncoder`] fills them without reallocating.

use crate::constants::max_kmers_per_supermer;
use crate::encoding::{pack_codes, packed_len, unpack_code};
use crate::kmer::{Kmer, KmerBits};

/// One supermer: `num_kmers` windows starting at k-mer `start`, all sent to `task`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupermerRun {
    /// Index of the first k-mer window in the read
    pub start: usize,
    /// Number of k-mer windows covered
    pub num_kmers: usize,
    /// Destination task
    pub task: u32,
}

impl SupermerRun {
    /// Length of the supermer in bases
    #[inline]
    pub fn num_bases(&self, k: usize) -> usize {
        self.num_kmers + k - 1
    }
}

/// Iterator over the supermer runs of one destination sequence
pub struct SupermerRuns<'a> {
    destinations: &'a [u32],
    pos: usize,
    max_kmers: usize,
}

impl Iterator for SupermerRuns<'_> {
    type Item = SupermerRun;

    fn next(&mut self) -> Option<SupermerRun> {
        let start = self.pos;
        let task = *self.destinations.get(start)?;
        let mut end = start + 1;
        while end < self.destinations.len()
            && self.destinations[end] == task
            && end - start < self.max_kmers
        {
            end += 1;
        }
        self.pos = end;
        Some(SupermerRun { start, num_kmers: end - start, task })
    }
}

/// Split a destination sequence into supermer runs of at most `max_len` bases
///
/// # Panics
/// Panics if `max_len < k`.
pub fn supermer_runs(destinations: &[u32], k: usize, max_len: usize) -> SupermerRuns<'_> {
    assert!(max_len >= k, "max supermer length {max_len} is shorter than k={k}");
    SupermerRuns {
        destinations,
        pos: 0,
        max_kmers: max_kmers_per_supermer(k, max_len),
    }
}

/// Per-task supermer counts and payload bytes, used to pre-size buffers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupermerTally {
    /// Supermers per task
    pub counts: Vec<usize>,
    /// Packed payload bytes per task
    pub bytes: Vec<usize>,
}

impl SupermerTally {
    /// Empty tally over `num_tasks` tasks
    pub fn new(num_tasks: usize) -> Self {
        Self { counts: vec![0; num_tasks], bytes: vec![0; num_tasks] }
    }

    /// Account for the supermers of one read
    pub fn add_read(&mut self, destinations: &[u32], k: usize, max_len: usize) {
        for run in supermer_runs(destinations, k, max_len) {
            let task = run.task as usize;
            self.counts[task] += 1;
            self.bytes[task] += packed_len(run.num_bases(k));
        }
    }
}

/// Appends supermers to per-task length and payload buffers
pub struct SupermerEncoder<'a> {
    lengths: &'a mut [Vec<u32>],
    payloads: &'a mut [Vec<u8>],
    k: usize,
    max_len: usize,
}

impl<'a> SupermerEncoder<'a> {
    /// Encoder writing into `lengths[task]` and `payloads[task]`
    pub fn new(
        lengths: &'a mut [Vec<u32>],
        payloads: &'a mut [Vec<u8>],
        k: usize,
        max_len: usize,
    ) -> Self {
        debug_assert_eq!(lengths.len(), payloads.len());
        Self { lengths, payloads, k, max_len }
    }

    /// Reserve exactly what `tally` says each task will receive
    pub fn reserve(&mut self, tally: &SupermerTally) {
        for (task, (&count, &bytes)) in tally.counts.iter().zip(&tally.bytes).enumerate() {
            self.lengths[task].reserve_exact(count);
            self.payloads[task].reserve_exact(bytes);
        }
    }

    /// Encode the supermers of `read`, whose destination sequence is `destinations`
    ///
    /// Returns the number of supermers written.
    pub fn encode(&mut self, read: &[u8], destinations: &[u32]) -> usize {
        let mut written = 0;
        for run in supermer_runs(destinations, self.k, self.max_len) {
            let task = run.task as usize;
            let num_bases = run.num_bases(self.k);
            self.lengths[task].push(num_bases as u32);
            pack_codes(&read[run.start..run.start + num_bases], &mut self.payloads[task]);
            written += 1;
        }
        written
    }
}

/// Iterate `(num_bases, packed bytes)` records of a supermer stream
pub fn supermer_records<'a>(
    lengths: &'a [u32],
    payload: &'a [u8],
) -> impl Iterator<Item = (usize, &'a [u8])> + 'a {
    let mut offset = 0;
    lengths.iter().map(move |&len| {
        let len = len as usize;
        let bytes = packed_len(len);
        let record = &payload[offset..offset + bytes];
        offset += bytes;
        (len, record)
    })
}

/// Packed bytes a stream with these lengths occupies
pub fn payload_len(lengths: &[u32]) -> usize {
    lengths.iter().map(|&len| packed_len(len as usize)).sum()
}

/// Number of k-mers carried by supermers with these lengths
pub fn seed_count(lengths: &[u32], k: usize) -> usize {
    lengths.iter().map(|&len| (len as usize + 1).saturating_sub(k)).sum()
}

/// Call `emit` with the canonical form of every k-mer in one packed supermer
pub fn for_each_kmer<const K: usize>(packed: &[u8], num_bases: usize, mut emit: impl FnMut(Kmer<K>))
where
    Kmer<K>: KmerBits,
{
    if num_bases < K {
        return;
    }
    let mut kmer = Kmer::<K>::default();
    for i in 0..K {
        kmer = kmer.push_base(unpack_code(packed, i));
    }
    emit(kmer.canonical());
    for i in K..num_bases {
        kmer = kmer.push_base(unpack_code(packed, i));
        emit(kmer.canonical());
    }
}

/// Append the big-endian keys of all canonical k-mers in a supermer stream to `out`
pub fn write_seed_keys<const K: usize>(lengths: &[u32], payload: &[u8], out: &mut Vec<u8>)
where
    Kmer<K>: KmerBits,
{
    let width = Kmer::<K>::BYTES;
    out.reserve(seed_count(lengths, K) * width);
    let mut key = [0u8; 16];
    for (num_bases, record) in supermer_records(lengths, payload) {
        for_each_kmer::<K>(record, num_bases, |kmer| {
            kmer.write_key(&mut key);
            out.extend_from_slice(&key[..width]);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_sequence;
    use crate::minimizer::find_destinations;

    #[test]
    fn test_runs_split_on_task_change() {
        let dests = [3, 3, 3, 1, 1, 3];
        let runs: Vec<_> = supermer_runs(&dests, 4, 100).collect();
        assert_eq!(
            runs,
            vec![
                SupermerRun { start: 0, num_kmers: 3, task: 3 },
                SupermerRun { start: 3, num_kmers: 2, task: 1 },
                SupermerRun { start: 5, num_kmers: 1, task: 3 },
            ]
        );
        assert_eq!(runs[0].num_bases(4), 6);
    }

    #[test]
    fn test_runs_respect_max_len() {
        let dests = [0u32; 10];
        let runs: Vec<_> = supermer_runs(&dests, 5, 7).collect();
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().all(|r| r.num_bases(5) <= 7));
        assert_eq!(runs.iter().map(|r| r.num_kmers).sum::<usize>(), 10);

        // max_len == k degrades to one k-mer per supermer
        assert_eq!(supermer_runs(&dests, 5, 5).count(), 10);
    }

    #[test]
    fn test_runs_expand_to_destinations() {
        let read = encode_sequence(b"CATTGACCGGTAGCTAGGATCCATGACGTTAGCAGT").unwrap();
        for max_len in [6, 9, 64] {
            let dests = find_destinations(&read, 6, 3, 5, 11);
            let expanded: Vec<u32> = supermer_runs(&dests, 6, max_len)
                .flat_map(|run| std::iter::repeat(run.task).take(run.num_kmers))
                .collect();
            assert_eq!(expanded, dests);
        }
    }

    #[test]
    fn test_encoder_matches_tally() {
        let read = encode_sequence(b"TGCATGCAAACCGTTAGGCTAGCATCG").unwrap();
        let dests = find_destinations(&read, 5, 3, 4, 2);

        let mut tally = SupermerTally::new(4);
        tally.add_read(&dests, 5, 8);

        let mut lengths = vec![Vec::new(); 4];
        let mut payloads = vec![Vec::new(); 4];
        let mut encoder = SupermerEncoder::new(&mut lengths, &mut payloads, 5, 8);
        encoder.reserve(&tally);
        let written = encoder.encode(&read, &dests);

        assert_eq!(written, tally.counts.iter().sum::<usize>());
        for task in 0..4 {
            assert_eq!(lengths[task].len(), tally.counts[task]);
            assert_eq!(payloads[task].len(), tally.bytes[task]);
            assert_eq!(payload_len(&lengths[task]), payloads[task].len());
        }
    }

    #[test]
    fn test_decoded_kmers_match_read() {
        let ascii = b"GGCATTACAGATTACCAGTTGA";
        let read = encode_sequence(ascii).unwrap();
        let dests = find_destinations(&read, 4, 2, 3, 5);

        let mut lengths = vec![Vec::new(); 3];
        let mut payloads = vec![Vec::new(); 3];
        SupermerEncoder::new(&mut lengths, &mut payloads, 4, 7).encode(&read, &dests);

        for task in 0..3u32 {
            let mut decoded = Vec::new();
            for (len, record) in supermer_records(&lengths[task as usize], &payloads[task as usize]) {
                for_each_kmer::<4>(record, len, |kmer| decoded.push(kmer));
            }
            let mut expected: Vec<Kmer<4>> = dests
                .iter()
                .enumerate()
                .filter(|(_, &d)| d == task)
                .map(|(p, _)| {
                    Kmer::<4>::from_str(std::str::from_utf8(&ascii[p..p + 4]).unwrap())
                        .unwrap()
                        .canonical()
                })
                .collect();
            decoded.sort();
            expected.sort();
            assert_eq!(decoded, expected);
            assert_eq!(seed_count(&lengths[task as usize], 4), expected.len());
        }
    }

    #[test]
    fn test_write_seed_keys() {
        let read = encode_sequence(b"ACGTTGCA").unwrap();
        let mut payload = Vec::new();
        pack_codes(&read, &mut payload);

        let mut keys = Vec::new();
        write_seed_keys::<5>(&[8], &payload, &mut keys);
        assert_eq!(keys.len(), 4 * Kmer::<5>::BYTES);

        let first = Kmer::<5>::from_key(&keys[..2]);
        assert_eq!(first, Kmer::<5>::from_str("ACGTT").unwrap().canonical());
    }
}
