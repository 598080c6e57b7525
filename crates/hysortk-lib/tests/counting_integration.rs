//! Integration tests for the counting pipeline
//!
//! Every test counts a set of reads with one or more in-process ranks and
//! compares the result with a direct count of canonical k-mer windows.

use std::collections::HashMap;

use hysortk_lib::{
    Communicator, CountConfig, CountError, CountOutput, DnaBuffer, Kmer, KmerBits, KmerCounter,
    LocalGroup, SortPolicy, SortStrategy,
};

/// Small xorshift generator so the inputs are reproducible
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

/// Reads sampled from a short random genome, so most k-mers repeat
fn sampled_reads(seed: u64, genome_len: usize, num_reads: usize) -> Vec<String> {
    let mut rng = XorShift(seed);
    let genome: Vec<u8> = (0..genome_len).map(|_| b"ACGT"[rng.below(4)]).collect();
    (0..num_reads)
        .map(|_| {
            let len = 8 + rng.below(100);
            let start = rng.below(genome_len - len);
            let mut read = genome[start..start + len].to_vec();
            if rng.below(10) == 0 {
                let pos = rng.below(len);
                read[pos] = b'N';
            }
            String::from_utf8(read).unwrap()
        })
        .collect()
}

/// Canonical k-mer counts computed window by window
fn direct_counts<const K: usize>(reads: &[String]) -> HashMap<u128, u32>
where
    Kmer<K>: KmerBits,
{
    let mut counts = HashMap::new();
    for read in reads {
        for piece in read.split(|c: char| !matches!(c, 'A' | 'C' | 'G' | 'T')) {
            if piece.len() < K {
                continue;
            }
            for start in 0..=piece.len() - K {
                let kmer = Kmer::<K>::from_str(&piece[start..start + K]).unwrap();
                *counts.entry(kmer.canonical().as_u128()).or_insert(0) += 1;
            }
        }
    }
    counts
}

fn run_count<const K: usize>(reads: &[String], ranks: usize, config: &CountConfig) -> Vec<CountOutput<K>>
where
    Kmer<K>: KmerBits,
{
    let buffer = DnaBuffer::from_sequences(reads.iter().map(String::as_str));
    let parts = buffer.partition(ranks);
    LocalGroup::run(ranks, |comm| -> Result<CountOutput<K>, CountError> {
        KmerCounter::new(comm, config.clone())?.count::<K, _>(&parts[comm.rank()])
    })
    .into_iter()
    .map(|result| result.unwrap())
    .collect()
}

/// Union of the per-rank outputs, asserting that no k-mer lives on two ranks
fn merged<const K: usize>(outputs: &[CountOutput<K>]) -> HashMap<u128, u32>
where
    Kmer<K>: KmerBits,
{
    let mut all = HashMap::new();
    for output in outputs {
        for entry in &output.kmers {
            assert_eq!(entry.kmer, entry.kmer.canonical());
            let previous = all.insert(entry.kmer.as_u128(), entry.count);
            assert!(previous.is_none(), "k-mer counted on two ranks");
        }
    }
    all
}

fn unfiltered(k: usize, m: usize) -> CountConfig {
    CountConfig {
        num_threads: 2,
        threads_per_worker: 1,
        filter: false,
        ..CountConfig::new(k, m).unwrap()
    }
}

#[test]
fn test_single_rank_matches_direct_count() {
    let reads = sampled_reads(7, 400, 60);
    let outputs = run_count::<15>(&reads, 1, &unfiltered(15, 7));
    assert_eq!(merged(&outputs), direct_counts::<15>(&reads));
}

#[test]
fn test_four_short_reads() {
    let reads: Vec<String> = ["ACGTACGTAC", "AAAAAAAAAA", "GTACCATGCA", "TTTTGGCCAA"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let outputs = run_count::<4>(&reads, 1, &unfiltered(4, 2));
    let counts = merged(&outputs);
    assert_eq!(counts, direct_counts::<4>(&reads));
    assert_eq!(counts.values().sum::<u32>(), 4 * 7);

    // seven windows of the poly-A read, one more as TTTT
    let aaaa = Kmer::<4>::from_str("AAAA").unwrap().as_u128();
    assert_eq!(counts[&aaaa], 8);
}

#[test]
fn test_rank_count_does_not_change_counts() {
    let reads = sampled_reads(11, 600, 90);
    let config = unfiltered(21, 9);
    let one = merged(&run_count::<21>(&reads, 1, &config));
    let three = merged(&run_count::<21>(&reads, 3, &config));
    assert_eq!(one, three);
    assert_eq!(one, direct_counts::<21>(&reads));
}

#[test]
fn test_exchange_conserves_bytes_and_seeds() {
    let reads = sampled_reads(3, 500, 80);
    let config = CountConfig { unbalanced_ratio: 1e12, ..unfiltered(17, 8) };
    let outputs = run_count::<17>(&reads, 3, &config);

    let num_tasks = outputs[0].stats.exchange.sent.len();
    for task in 0..num_tasks {
        let sent: u64 = outputs.iter().map(|o| o.stats.exchange.sent[task]).sum();
        let received: u64 = outputs.iter().map(|o| o.stats.exchange.received[task]).sum();
        assert_eq!(sent, received, "task {task}");
    }

    let windows: u32 = direct_counts::<17>(&reads).values().sum();
    let seeds: u64 = outputs.iter().map(|o| o.stats.seeds_received).sum();
    assert_eq!(seeds, windows as u64);
    assert!(outputs.iter().all(|o| o.stats.unbalanced_owned == 0));

    let offsets: Vec<u64> = outputs.iter().map(|o| o.stats.read_offset).collect();
    let sizes: Vec<u64> = outputs.iter().map(|o| o.stats.reads as u64).collect();
    assert_eq!(offsets, vec![0, sizes[0], sizes[0] + sizes[1]]);
}

#[test]
fn test_tiny_batches_take_many_rounds() {
    let reads = sampled_reads(5, 300, 40);
    let config = CountConfig { max_send_batch: 24, ..unfiltered(13, 5) };
    let outputs = run_count::<13>(&reads, 2, &config);
    assert!(outputs.iter().all(|o| o.stats.exchange.rounds > 2));
    assert_eq!(merged(&outputs), direct_counts::<13>(&reads));
}

#[test]
fn test_pre_aggregated_tasks_give_same_counts() {
    let reads = sampled_reads(19, 300, 120);
    let balanced = CountConfig { unbalanced_ratio: 1e12, ..unfiltered(11, 5) };
    let skewed = CountConfig { unbalanced_ratio: 1.0, ..unfiltered(11, 5) };

    let plain = run_count::<11>(&reads, 2, &balanced);
    let aggregated = run_count::<11>(&reads, 2, &skewed);
    assert!(aggregated.iter().map(|o| o.stats.unbalanced_owned).sum::<usize>() > 0);
    assert_eq!(merged(&plain), merged(&aggregated));
}

#[test]
fn test_sort_strategies_agree() {
    let reads = sampled_reads(23, 500, 70);
    let in_place = CountConfig { sort_policy: SortPolicy::InPlace, ..unfiltered(31, 15) };
    let aligned = CountConfig { sort_policy: SortPolicy::Aligned, ..unfiltered(31, 15) };

    let a = run_count::<31>(&reads, 2, &in_place);
    let b = run_count::<31>(&reads, 2, &aligned);
    assert!(a.iter().all(|o| o.stats.sort_strategy == SortStrategy::InPlace));
    assert!(b.iter().all(|o| o.stats.sort_strategy == SortStrategy::Aligned));
    assert_eq!(merged(&a), merged(&b));
}

#[test]
fn test_aligned_sort_of_pre_aggregated_entries() {
    let reads = sampled_reads(37, 400, 150);
    let config = CountConfig {
        sort_policy: SortPolicy::Aligned,
        unbalanced_ratio: 1.0,
        ..unfiltered(31, 13)
    };
    let outputs = run_count::<31>(&reads, 3, &config);

    assert!(outputs.iter().all(|o| o.stats.sort_strategy == SortStrategy::Aligned));
    assert!(outputs.iter().map(|o| o.stats.unbalanced_owned).sum::<usize>() > 0);
    assert_eq!(merged(&outputs), direct_counts::<31>(&reads));
}

#[test]
fn test_long_kmers() {
    let reads = sampled_reads(29, 800, 50);
    let outputs = run_count::<45>(&reads, 2, &unfiltered(45, 21));
    assert_eq!(merged(&outputs), direct_counts::<45>(&reads));
}

#[test]
fn test_frequency_band() {
    let reads = sampled_reads(31, 200, 60);
    let config = CountConfig {
        filter: true,
        lower_freq: 2,
        upper_freq: 6,
        ..unfiltered(9, 4)
    };
    let outputs = run_count::<9>(&reads, 2, &config);

    let expected: HashMap<u128, u32> = direct_counts::<9>(&reads)
        .into_iter()
        .filter(|(_, c)| (2..=6).contains(c))
        .collect();
    assert_eq!(merged(&outputs), expected);
}

#[test]
fn test_empty_rank() {
    let reads = vec!["ACGTTGCAAC".to_string(), "GGGGCCCCAA".to_string()];
    let outputs = run_count::<5>(&reads, 3, &unfiltered(5, 3));
    assert_eq!(outputs[2].stats.reads, 0);
    assert_eq!(merged(&outputs), direct_counts::<5>(&reads));
}

#[test]
fn test_count_from_fasta_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("reads.fa");
    std::fs::write(&path, ">r1\nACGTACGTTTGCA\n>r2\nTTGCANNACGTACG\n>r3\nGG\n")?;

    let buffer = DnaBuffer::from_fastx(&path)?;
    let config = unfiltered(5, 3);
    let outputs = LocalGroup::run(1, |comm| -> Result<CountOutput<5>, CountError> {
        KmerCounter::new(comm, config.clone())?.count::<5, _>(&buffer)
    });

    let reads: Vec<String> = ["ACGTACGTTTGCA", "TTGCANNACGTACG", "GG"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let output = outputs.into_iter().next().unwrap()?;
    assert_eq!(merged(std::slice::from_ref(&output)), direct_counts::<5>(&reads));
    Ok(())
}
