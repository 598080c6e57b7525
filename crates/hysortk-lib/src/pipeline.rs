//! Counting pipeline orchestration
//!
//! Runs the stages of a distributed count on one rank:
//! 1. Find minimizer destinations and encode supermers per thread
//! 2. Dispatch tasks to ranks
//! 3. Pre-aggregate unbalanced tasks and exchange lengths and supermers
//! 4. Sort every owned task and count runs
//!
//! Every rank of the group must call [`KmerCounter::count`] with the same
//! configuration; the collectives inside block until all ranks reach them.

use std::time::Instant;

use tracing::{info, info_span};

use crate::comm::Communicator;
use crate::config::CountConfig;
use crate::count::{count_tasks, KmerCount};
use crate::dispatcher::{balanced_dispatch, TaskDispatcher, TaskType};
use crate::error::CountError;
use crate::exchange::{exchange_tasks, ExchangeStats, ReceivedTasks};
use crate::kmer::{Kmer, KmerBits};
use crate::parallel_data::ParallelData;
use crate::reads::ReadSource;
use crate::sort::{sort_decision, HybridSorter, SortStrategy};

/// Counters of one rank's run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountStats {
    /// Reads given to this rank
    pub reads: usize,
    /// Reads shorter than k
    pub reads_skipped: usize,
    /// Global index of this rank's first read
    pub read_offset: u64,
    /// Supermers encoded here
    pub supermers_sent: usize,
    /// Seeds and pre-aggregated entries this rank sorted
    pub seeds_received: u64,
    /// Tasks owned by this rank
    pub tasks_owned: usize,
    /// Owned tasks received pre-aggregated
    pub unbalanced_owned: usize,
    /// Sort strategy applied to the owned tasks
    pub sort_strategy: SortStrategy,
    /// Byte counts of both exchanges
    pub exchange: ExchangeStats,
}

/// Result of a count on one rank
#[derive(Clone, Debug)]
pub struct CountOutput<const K: usize>
where
    Kmer<K>: KmerBits,
{
    /// K-mers owned by this rank that passed the frequency band
    pub kmers: Vec<KmerCount<K>>,
    /// Run counters
    pub stats: CountStats,
}

/// Distributed k-mer counter bound to one rank of a group
pub struct KmerCounter<'c, C: Communicator> {
    comm: &'c C,
    config: CountConfig,
}

impl<'c, C: Communicator> KmerCounter<'c, C> {
    /// Create a counter for the rank behind `comm`
    ///
    /// # Errors
    /// Returns [`CountError::Config`] if the configuration is invalid.
    pub fn new(comm: &'c C, config: CountConfig) -> Result<Self, CountError> {
        config.validate().map_err(CountError::Config)?;
        Ok(Self { comm, config })
    }

    /// The configuration in use
    pub fn config(&self) -> &CountConfig {
        &self.config
    }

    /// Count the k-mers of `reads` together with the other ranks
    ///
    /// `K` must equal `config.k`; use [`dispatch_on_k!`](crate::dispatch_on_k)
    /// to pick it from a runtime value.
    ///
    /// # Errors
    /// Any collective failure, size mismatch or sort failure aborts the
    /// count on this rank.
    pub fn count<const K: usize, R: ReadSource + ?Sized>(&self, reads: &R) -> Result<CountOutput<K>, CountError>
    where
        Kmer<K>: KmerBits,
    {
        if K != self.config.k {
            return Err(CountError::Config(format!(
                "counter configured for k={} was called with K={}",
                self.config.k, K
            )));
        }

        let span = info_span!("rank", rank = self.comm.rank());
        let _guard = span.enter();
        let start = Instant::now();
        if self.comm.rank() == 0 {
            self.config.print();
        }

        let read_offset = self.comm.exclusive_scan_sum_u64(reads.count() as u64)?;
        info!(
            "Rank holds {} reads ({} bases), first global read {}",
            reads.count(),
            reads.total_bases(),
            read_offset
        );

        let tasks_per_proc = self.agreed_tasks_per_proc()?;

        info!("Step 1: Partitioning reads into supermers...");
        let stage = Instant::now();
        let data = self.prepare_supermers(reads, tasks_per_proc)?;
        let reads_skipped = data.reads_skipped();
        let supermers_sent = data.total_supermers();
        info!(
            "  Encoded {} supermers, skipped {} short reads, took {:.3}s",
            supermers_sent,
            reads_skipped,
            stage.elapsed().as_secs_f64()
        );

        info!("Step 2: Dispatching tasks...");
        let stage = Instant::now();
        let dispatcher = self.dispatch_tasks(&data)?;
        info!("  Dispatch took {:.3}s", stage.elapsed().as_secs_f64());

        info!("Step 3: Exchanging supermers...");
        let stage = Instant::now();
        let (received, exchange) = self.exchange_supermers::<K>(data, &dispatcher)?;
        let seeds_received = received.sort_records(K);
        info!(
            "  Sent {} bytes, received {} bytes in {} rounds, took {:.3}s",
            exchange.total_sent(),
            exchange.total_received(),
            exchange.rounds,
            stage.elapsed().as_secs_f64()
        );
        self.log_seed_stats(seeds_received)?;

        info!("Step 4: Sorting and counting...");
        let stage = Instant::now();
        let tasks_owned = received.tasks().len();
        let unbalanced_owned = received
            .types()
            .iter()
            .filter(|t| **t == TaskType::Unbalanced)
            .count();
        let (kmers, sort_strategy) = self.sort_and_count::<K>(received)?;
        info!(
            "  Kept {} distinct k-mers with {:?} sort, took {:.3}s",
            kmers.len(),
            sort_strategy,
            stage.elapsed().as_secs_f64()
        );

        info!("Count took {:.3}s", start.elapsed().as_secs_f64());
        Ok(CountOutput {
            kmers,
            stats: CountStats {
                reads: reads.count(),
                reads_skipped,
                read_offset,
                supermers_sent,
                seeds_received,
                tasks_owned,
                unbalanced_owned,
                sort_strategy,
                exchange,
            },
        })
    }

    /// Tasks per process, checked to be equal on every rank
    fn agreed_tasks_per_proc(&self) -> Result<usize, CountError> {
        let ours = self.config.tasks_per_proc() as u64;
        let gathered = self.comm.all_gather_u64(&[ours])?;
        let all: Vec<u64> = gathered.iter().map(|w| w.first().copied().unwrap_or(0)).collect();
        if all.iter().any(|&n| n != ours) {
            return Err(CountError::TaskCountMismatch(all));
        }
        Ok(ours as usize)
    }

    fn pool(&self, threads: usize) -> Result<rayon::ThreadPool, CountError> {
        Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
    }

    /// Stage 1: destinations and supermers for every read of this rank
    pub fn prepare_supermers<R: ReadSource + ?Sized>(
        &self,
        reads: &R,
        tasks_per_proc: usize,
    ) -> Result<ParallelData, CountError> {
        let threads = self.config.partition_threads();
        let mut data = ParallelData::new(self.comm.size(), tasks_per_proc, threads);
        self.pool(threads)?.install(|| data.encode_reads(reads, &self.config));
        Ok(data)
    }

    /// Stage 2: agree on the owner and type of every task
    pub fn dispatch_tasks(&self, data: &ParallelData) -> Result<TaskDispatcher, CountError> {
        balanced_dispatch(self.comm, &data.local_task_sizes(), self.config.unbalanced_ratio)
    }

    /// Stage 3: pre-aggregate unbalanced tasks and move all payloads to their owners
    pub fn exchange_supermers<const K: usize>(
        &self,
        data: ParallelData,
        dispatcher: &TaskDispatcher,
    ) -> Result<(ReceivedTasks, ExchangeStats), CountError>
    where
        Kmer<K>: KmerBits,
    {
        let pool = self.pool(self.config.threads())?;
        let local = pool.install(|| data.preprocess::<K>(dispatcher.types()));
        exchange_tasks(
            self.comm,
            dispatcher,
            &local,
            KmerCount::<K>::ENTRY_BYTES,
            self.config.max_send_batch,
        )
    }

    /// Stage 4: sort every owned task and count runs within the frequency band
    pub fn sort_and_count<const K: usize>(
        &self,
        received: ReceivedTasks,
    ) -> Result<(Vec<KmerCount<K>>, SortStrategy), CountError>
    where
        Kmer<K>: KmerBits,
    {
        let threads = self.config.threads();
        let pool = self.pool(threads)?;
        let types = received.types().to_vec();
        let batches = pool.install(|| received.into_batches::<K>());

        let total_bytes: u64 = batches.iter().map(|b| b.bytes.len() as u64).sum();
        let strategy = sort_decision(total_bytes, self.config.sort_policy, self.config.procs_per_node);
        let sorter = HybridSorter::new(
            strategy,
            threads,
            self.config.threads_per_worker,
            self.config.sort_alignment,
        );
        let sorted = sorter.sort_all(batches)?;

        let kmers = pool.install(|| count_tasks::<K>(&sorted, &types, self.config.band()));
        Ok((kmers, strategy))
    }

    /// Log how evenly the seeds landed across ranks
    fn log_seed_stats(&self, local: u64) -> Result<(), CountError> {
        let gathered = self.comm.all_gather_u64(&[local])?;
        let counts: Vec<f64> = gathered
            .iter()
            .map(|w| w.first().copied().unwrap_or(0) as f64)
            .collect();
        let n = counts.len().max(1) as f64;
        let mean = counts.iter().sum::<f64>() / n;
        let variance = counts.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / n;
        let max = counts.iter().copied().fold(0.0, f64::max);
        let imbalance = if mean > 0.0 { max / mean } else { 1.0 };
        info!(
            "  Seeds per rank: local {}, mean {:.1}, stddev {:.1}, max/mean {:.3}",
            local,
            mean,
            variance.sqrt(),
            imbalance
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use crate::reads::DnaBuffer;

    #[test]
    fn test_rejects_invalid_config() {
        let comms = LocalGroup::new(1);
        let config = CountConfig { m: 40, ..CountConfig::default() };
        assert!(matches!(KmerCounter::new(&comms[0], config), Err(CountError::Config(_))));
    }

    #[test]
    fn test_rejects_wrong_k() {
        let comms = LocalGroup::new(1);
        let counter = KmerCounter::new(&comms[0], CountConfig::new(5, 3).unwrap()).unwrap();
        let reads = DnaBuffer::from_sequences(["ACGTACGT"]);
        assert!(matches!(counter.count::<7, _>(&reads), Err(CountError::Config(_))));
    }

    #[test]
    fn test_single_rank_counts() {
        let comms = LocalGroup::new(1);
        let config = CountConfig { num_threads: 2, filter: false, ..CountConfig::new(5, 3).unwrap() };
        let counter = KmerCounter::new(&comms[0], config).unwrap();
        let reads = DnaBuffer::from_sequences(["ACGTACGTAC", "GG", "TTTTTT"]);
        let output = counter.count::<5, _>(&reads).unwrap();

        // ACGTACGTAC: ACGTA/TACGT x3, CGTAC/GTACG x3; TTTTTT: AAAAA x2
        let mut counts: Vec<u32> = output.kmers.iter().map(|e| e.count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![2, 3, 3]);
        assert_eq!(output.stats.reads, 3);
        assert_eq!(output.stats.reads_skipped, 1);
        assert_eq!(output.stats.read_offset, 0);
        assert_eq!(output.stats.seeds_received, 8);
        assert_eq!(output.stats.tasks_owned, config_tasks(2));
    }

    fn config_tasks(threads: usize) -> usize {
        CountConfig { num_threads: threads, ..CountConfig::default() }.tasks_per_proc()
    }

    #[test]
    fn test_task_count_disagreement() {
        let results = LocalGroup::run(2, |comm| -> Result<(), CountError> {
            let config = CountConfig {
                num_threads: 4,
                threads_per_worker: 1 + comm.rank(),
                ..CountConfig::new(5, 3).unwrap()
            };
            let counter = KmerCounter::new(comm, config)?;
            counter.count::<5, _>(&DnaBuffer::from_sequences(["ACGTACGT"])).map(|_| ())
        });
        for result in results {
            assert!(matches!(result, Err(CountError::TaskCountMismatch(ref n)) if n == &vec![12, 6]));
        }
    }
}
