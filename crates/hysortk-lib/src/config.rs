//! Counting configuration
//!
//! Every compile-time default of [`crate::constants`] can be overridden
//! here. All ranks of a run must use the same configuration: task counts,
//! hashing and the dispatcher are derived from it.

use crate::constants::{
    AVG_TASK_PER_WORKER, DEFAULT_KMER_SIZE, DEFAULT_MINIMIZER_SIZE, DEFAULT_SEED,
    DEFAULT_THREADS_PER_WORKER, LOWER_KMER_FREQ, MAX_K, MAX_M, MAX_SEND_BATCH,
    MAX_SUPERMER_LEN, MAX_THREADS_MEMBOUNDED, MIN_K, SORT_ALIGNMENT, UNBALANCED_RATIO,
    UPPER_KMER_FREQ,
};
use crate::count::FrequencyBand;
use crate::sort::SortPolicy;

/// Configuration parameters of a counting run
#[derive(Debug, Clone)]
pub struct CountConfig {
    /// K-mer length (2 to 63)
    pub k: usize,

    /// Minimizer length (m < k, at most 32)
    pub m: usize,

    /// Seed of the minimizer hash
    pub seed: u64,

    /// Threads per process (0 = size of the current rayon pool)
    pub num_threads: usize,

    /// Threads given to one sort worker
    pub threads_per_worker: usize,

    /// Cap on threads in the memory-bound partitioning stage
    pub max_threads_membounded: usize,

    /// Tasks created per sort worker
    pub avg_tasks_per_worker: usize,

    /// Longest supermer in bases
    pub max_supermer_len: usize,

    /// Smallest count kept when filtering
    pub lower_freq: u32,

    /// Largest count kept when filtering
    pub upper_freq: u32,

    /// Drop counts outside `lower_freq..=upper_freq`
    pub filter: bool,

    /// Bytes sent per exchange round, over all peers
    pub max_send_batch: usize,

    /// A task above this multiple of the mean task size is pre-aggregated
    pub unbalanced_ratio: f64,

    /// Sort strategy selection
    pub sort_policy: SortPolicy,

    /// Buffer alignment required by the aligned sort
    pub sort_alignment: usize,

    /// Processes sharing a node (None = read `SLURM_TASKS_PER_NODE`)
    pub procs_per_node: Option<usize>,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_KMER_SIZE,
            m: DEFAULT_MINIMIZER_SIZE,
            seed: DEFAULT_SEED,
            num_threads: 0,
            threads_per_worker: DEFAULT_THREADS_PER_WORKER,
            max_threads_membounded: MAX_THREADS_MEMBOUNDED,
            avg_tasks_per_worker: AVG_TASK_PER_WORKER,
            max_supermer_len: MAX_SUPERMER_LEN,
            lower_freq: LOWER_KMER_FREQ,
            upper_freq: UPPER_KMER_FREQ,
            filter: true,
            max_send_batch: MAX_SEND_BATCH,
            unbalanced_ratio: UNBALANCED_RATIO,
            sort_policy: SortPolicy::Auto,
            sort_alignment: SORT_ALIGNMENT,
            procs_per_node: None,
        }
    }
}

impl CountConfig {
    /// Create a configuration with the given k-mer and minimizer lengths
    pub fn new(k: usize, m: usize) -> Result<Self, String> {
        let config = Self { k, m, ..Self::default() };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.k < MIN_K || self.k > MAX_K {
            return Err(format!("k must be in range [{MIN_K}, {MAX_K}], got k={}", self.k));
        }
        if self.m == 0 || self.m >= self.k {
            return Err(format!("m must be in range [1, k), got m={}, k={}", self.m, self.k));
        }
        if self.m > MAX_M {
            return Err(format!("m must be at most {MAX_M}, got m={}", self.m));
        }
        if self.max_supermer_len < self.k {
            return Err(format!(
                "max supermer length must be at least k, got {} < {}",
                self.max_supermer_len, self.k
            ));
        }
        if self.max_supermer_len > u32::MAX as usize {
            return Err(format!("max supermer length {} does not fit in 32 bits", self.max_supermer_len));
        }
        if self.lower_freq > self.upper_freq {
            return Err(format!(
                "lower frequency {} exceeds upper frequency {}",
                self.lower_freq, self.upper_freq
            ));
        }
        if self.max_send_batch == 0 {
            return Err("send batch must be at least one byte".to_string());
        }
        if self.threads_per_worker == 0 || self.max_threads_membounded == 0 || self.avg_tasks_per_worker == 0 {
            return Err("thread and task counts must be positive".to_string());
        }
        if !self.sort_alignment.is_power_of_two() {
            return Err(format!("sort alignment must be a power of two, got {}", self.sort_alignment));
        }
        if self.unbalanced_ratio.is_nan() || self.unbalanced_ratio < 1.0 {
            return Err(format!("unbalanced ratio must be at least 1, got {}", self.unbalanced_ratio));
        }
        if self.procs_per_node == Some(0) {
            return Err("procs per node must be positive".to_string());
        }
        Ok(())
    }

    /// Threads this process uses
    pub fn threads(&self) -> usize {
        if self.num_threads == 0 {
            rayon::current_num_threads().max(1)
        } else {
            self.num_threads
        }
    }

    /// Threads used while finding minimizers and encoding supermers
    pub fn partition_threads(&self) -> usize {
        self.threads().min(self.max_threads_membounded).max(1)
    }

    /// Sort workers of this process
    pub fn sort_workers(&self) -> usize {
        (self.threads() / self.threads_per_worker).max(1)
    }

    /// Tasks owned on average by one process
    pub fn tasks_per_proc(&self) -> usize {
        self.sort_workers() * self.avg_tasks_per_worker
    }

    /// Frequency band applied to the final counts
    pub fn band(&self) -> FrequencyBand {
        if self.filter {
            FrequencyBand::new(self.lower_freq, self.upper_freq)
        } else {
            FrequencyBand::UNFILTERED
        }
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Count Configuration:");
        tracing::info!("  k = {}", self.k);
        tracing::info!("  m = {}", self.m);
        tracing::debug!("  seed = {}", self.seed);
        if self.num_threads == 0 {
            tracing::info!("  num_threads = rayon pool ({})", self.threads());
        } else {
            tracing::info!("  num_threads = {}", self.num_threads);
        }
        tracing::debug!("  threads_per_worker = {}", self.threads_per_worker);
        tracing::debug!("  max_threads_membounded = {}", self.max_threads_membounded);
        tracing::debug!("  avg_tasks_per_worker = {}", self.avg_tasks_per_worker);
        tracing::debug!("  max_supermer_len = {}", self.max_supermer_len);
        if self.filter {
            tracing::info!("  frequency band = [{}, {}]", self.lower_freq, self.upper_freq);
        } else {
            tracing::info!("  frequency band = unfiltered");
        }
        tracing::debug!("  max_send_batch = {} bytes", self.max_send_batch);
        tracing::debug!("  unbalanced_ratio = {}", self.unbalanced_ratio);
        tracing::info!("  sort_policy = {:?}", self.sort_policy);
        tracing::debug!("  sort_alignment = {}", self.sort_alignment);
        tracing::debug!("  procs_per_node = {:?}", self.procs_per_node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CountConfig::default();
        assert_eq!(config.k, 31);
        assert_eq!(config.m, 17);
        assert!(config.filter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_config() {
        let config = CountConfig::new(21, 11).unwrap();
        assert_eq!(config.k, 21);
        assert_eq!(config.m, 11);
    }

    #[test]
    fn test_validate_m_ge_k() {
        assert!(CountConfig::new(21, 21).is_err());
        assert!(CountConfig::new(21, 0).is_err());
        assert!(CountConfig::new(63, 33).is_err());
    }

    #[test]
    fn test_validate_k_out_of_range() {
        assert!(CountConfig::new(64, 17).is_err());
        assert!(CountConfig::new(1, 1).is_err());
        assert!(CountConfig::new(2, 1).is_ok());
    }

    #[test]
    fn test_validate_limits() {
        let base = CountConfig::new(31, 17).unwrap();
        assert!(CountConfig { max_supermer_len: 30, ..base.clone() }.validate().is_err());
        assert!(CountConfig { lower_freq: 60, ..base.clone() }.validate().is_err());
        assert!(CountConfig { max_send_batch: 0, ..base.clone() }.validate().is_err());
        assert!(CountConfig { threads_per_worker: 0, ..base.clone() }.validate().is_err());
        assert!(CountConfig { unbalanced_ratio: 0.5, ..base.clone() }.validate().is_err());
        assert!(CountConfig { unbalanced_ratio: f64::NAN, ..base.clone() }.validate().is_err());
        assert!(CountConfig { sort_alignment: 100, ..base.clone() }.validate().is_err());
        assert!(CountConfig { procs_per_node: Some(0), ..base }.validate().is_err());
    }

    #[test]
    fn test_derived_counts() {
        let config = CountConfig {
            num_threads: 10,
            threads_per_worker: 4,
            max_threads_membounded: 8,
            ..CountConfig::default()
        };
        assert_eq!(config.sort_workers(), 2);
        assert_eq!(config.tasks_per_proc(), 6);
        assert_eq!(config.partition_threads(), 8);

        let single = CountConfig { num_threads: 1, ..CountConfig::default() };
        assert_eq!(single.sort_workers(), 1);
        assert_eq!(single.tasks_per_proc(), 3);
        assert_eq!(single.partition_threads(), 1);
    }

    #[test]
    fn test_band() {
        let config = CountConfig::default();
        assert_eq!(config.band(), FrequencyBand::new(2, 50));
        let open = CountConfig { filter: false, ..config };
        assert_eq!(open.band(), FrequencyBand::UNFILTERED);
    }
}
