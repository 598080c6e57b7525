//! Constants and defaults for the k-mer counter
//!
//! Every value here is a default for a field of
//! [`CountConfig`](crate::config::CountConfig); the pipeline only ever reads
//! the configuration, so callers can override any of them per run.

/// Default seed for the minimizer hash function
pub const DEFAULT_SEED: u64 = 1;

/// Default k-mer length
pub const DEFAULT_KMER_SIZE: usize = 31;

/// Default minimizer length
pub const DEFAULT_MINIMIZER_SIZE: usize = 17;

/// Maximum number of bases in a single supermer record
pub const MAX_SUPERMER_LEN: usize = 255;

/// Lowest k-mer frequency kept by the filter (inclusive)
pub const LOWER_KMER_FREQ: u32 = 2;

/// Highest k-mer frequency kept by the filter (inclusive)
pub const UPPER_KMER_FREQ: u32 = 50;

/// Bytes moved per exchange round, summed over all peers
pub const MAX_SEND_BATCH: usize = 16 * 1024 * 1024;

/// Threads given to one sort worker when the process is fully loaded
pub const DEFAULT_THREADS_PER_WORKER: usize = 4;

/// Upper bound on threads used while partitioning reads
///
/// Partitioning is memory-bandwidth bound, more threads than this only
/// add per-thread buffers.
pub const MAX_THREADS_MEMBOUNDED: usize = 16;

/// Tasks created per sort worker
pub const AVG_TASK_PER_WORKER: usize = 3;

/// Start-address alignment required by the aligned radix sort
pub const SORT_ALIGNMENT: usize = 256;

/// A task is pre-aggregated when it is this many times larger than the mean
pub const UNBALANCED_RATIO: f64 = 8.0;

/// Fraction of free memory the aligned sort may plan to use
pub const SORT_MEMORY_FRACTION: f64 = 0.9;

/// Largest count given its own histogram slot; higher counts share the last one
pub const HISTOGRAM_MAX_COUNT: u32 = 1 << 16;

/// Minimum supported k-mer length
pub const MIN_K: usize = 2;

/// Maximum supported k-mer length
pub const MAX_K: usize = 63;

/// Maximum minimizer length (minimizers are packed into a `u64`)
pub const MAX_M: usize = 32;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Check if a k-mer size is supported
#[inline]
pub const fn is_valid_k(k: usize) -> bool {
    k >= MIN_K && k <= MAX_K
}

/// Number of k-mers a supermer of at most `max_len` bases can carry
#[inline]
pub const fn max_kmers_per_supermer(k: usize, max_len: usize) -> usize {
    max_len + 1 - k
}
