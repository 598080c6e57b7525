//! Per-thread partitioning state
//!
//! Each partitioning thread owns one [`ThreadSlot`]: the destination
//! sequences of a contiguous block of reads and, per task, the supermer
//! lengths and packed bytes produced from them. Slots never share buffers,
//! so the encoding stage runs without locks.
//!
//! Once the dispatcher has fixed the type of every task,
//! [`ParallelData::preprocess`] gathers the slices of all threads into one
//! flat payload per task, pre-aggregating the unbalanced ones.

use std::ops::Range;

use rayon::prelude::*;
use tracing::debug;

use crate::config::CountConfig;
use crate::count::{count_sorted_seeds, FrequencyBand, KmerCount};
use crate::dispatcher::TaskType;
use crate::kmer::{Kmer, KmerBits};
use crate::minimizer::MinimizerWindow;
use crate::reads::{block_range, ReadSource};
use crate::sort::msd_radix_sort;
use crate::supermer::{write_seed_keys, SupermerEncoder, SupermerTally};

/// State written by one partitioning thread
#[derive(Clone, Debug, Default)]
pub struct ThreadSlot {
    reads: Range<usize>,
    skipped: usize,
    destinations: Vec<u32>,
    lengths: Vec<Vec<u32>>,
    supermers: Vec<Vec<u8>>,
}

impl ThreadSlot {
    fn new(num_tasks: usize) -> Self {
        Self {
            reads: 0..0,
            skipped: 0,
            destinations: Vec::new(),
            lengths: vec![Vec::new(); num_tasks],
            supermers: vec![Vec::new(); num_tasks],
        }
    }

    fn encode<R: ReadSource + ?Sized>(&mut self, reads: &R, range: Range<usize>, config: &CountConfig, total_tasks: usize) {
        let (k, max_len) = (config.k, config.max_supermer_len);
        let mut window = MinimizerWindow::new(k, config.m, total_tasks, config.seed);

        self.reads = range.clone();
        self.skipped = 0;
        self.destinations.clear();
        for read in range.clone() {
            if reads.length(read) < k {
                self.skipped += 1;
                continue;
            }
            window.find_destinations(reads.symbols(read), &mut self.destinations);
        }

        let mut tally = SupermerTally::new(total_tasks);
        let mut offset = 0;
        for read in range.clone() {
            let n = window.num_windows(reads.length(read));
            tally.add_read(&self.destinations[offset..offset + n], k, max_len);
            offset += n;
        }

        let mut encoder = SupermerEncoder::new(&mut self.lengths, &mut self.supermers, k, max_len);
        encoder.reserve(&tally);
        let mut offset = 0;
        for read in range {
            let symbols = reads.symbols(read);
            let n = window.num_windows(symbols.len());
            encoder.encode(symbols, &self.destinations[offset..offset + n]);
            offset += n;
        }
    }
}

/// Supermers of one process, split by thread and task
#[derive(Clone, Debug)]
pub struct ParallelData {
    nprocs: usize,
    tasks_per_proc: usize,
    slots: Vec<ThreadSlot>,
}

impl ParallelData {
    /// Empty state for `nthreads` threads and `nprocs * tasks_per_proc` tasks
    pub fn new(nprocs: usize, tasks_per_proc: usize, nthreads: usize) -> Self {
        let num_tasks = nprocs * tasks_per_proc;
        Self {
            nprocs,
            tasks_per_proc,
            slots: (0..nthreads.max(1)).map(|_| ThreadSlot::new(num_tasks)).collect(),
        }
    }

    /// Find destinations and encode supermers for every read
    ///
    /// Thread `t` handles the `t`-th contiguous block of reads. Runs on the
    /// current rayon pool.
    pub fn encode_reads<R: ReadSource + ?Sized>(&mut self, reads: &R, config: &CountConfig) {
        let total_tasks = self.num_tasks();
        let nthreads = self.slots.len();
        let count = reads.count();
        self.slots.par_iter_mut().enumerate().for_each(|(thread, slot)| {
            slot.encode(reads, block_range(count, thread, nthreads), config, total_tasks);
        });
        debug!(
            "Encoded {} supermers from {} reads on {} threads",
            self.total_supermers(),
            count,
            nthreads
        );
    }

    /// Number of processes the tasks are spread over
    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// Tasks per process
    pub fn tasks_per_proc(&self) -> usize {
        self.tasks_per_proc
    }

    /// Tasks over all processes
    pub fn num_tasks(&self) -> usize {
        self.nprocs * self.tasks_per_proc
    }

    /// Number of partitioning threads
    pub fn num_threads(&self) -> usize {
        self.slots.len()
    }

    /// Reads handled by `thread`
    pub fn read_range(&self, thread: usize) -> Range<usize> {
        self.slots[thread].reads.clone()
    }

    /// Destination sequences of the reads of `thread`, concatenated
    pub fn destinations(&self, thread: usize) -> &[u32] {
        &self.slots[thread].destinations
    }

    /// Reads shorter than k, over all threads
    pub fn reads_skipped(&self) -> usize {
        self.slots.iter().map(|s| s.skipped).sum()
    }

    /// Supermer lengths and packed bytes written by `thread` for `task`
    pub fn thread_slice(&self, thread: usize, task: usize) -> (&[u32], &[u8]) {
        let slot = &self.slots[thread];
        (&slot.lengths[task], &slot.supermers[task])
    }

    /// Supermers bound for `task`
    pub fn supermer_count(&self, task: usize) -> usize {
        self.slots.iter().map(|s| s.lengths[task].len()).sum()
    }

    /// Supermers over all tasks
    pub fn total_supermers(&self) -> usize {
        self.slots
            .iter()
            .flat_map(|s| s.lengths.iter())
            .map(Vec::len)
            .sum()
    }

    /// Packed supermer bytes per task, the dispatcher's size estimate
    pub fn local_task_sizes(&self) -> Vec<u64> {
        (0..self.num_tasks())
            .map(|task| {
                self.slots
                    .iter()
                    .map(|s| s.supermers[task].len() as u64)
                    .sum()
            })
            .collect()
    }

    /// Gather each task's thread slices into one payload, in thread order
    ///
    /// Unbalanced tasks are turned into sorted (k-mer, count) entries here,
    /// without filtering. Runs on the current rayon pool.
    pub fn preprocess<const K: usize>(self, types: &[TaskType]) -> LocalTasks
    where
        Kmer<K>: KmerBits,
    {
        let num_tasks = self.num_tasks();
        debug_assert_eq!(types.len(), num_tasks);

        let mut pieces: Vec<Vec<(Vec<u32>, Vec<u8>)>> =
            (0..num_tasks).map(|_| Vec::with_capacity(self.slots.len())).collect();
        for slot in self.slots {
            for (task, piece) in slot.lengths.into_iter().zip(slot.supermers).enumerate() {
                pieces[task].push(piece);
            }
        }

        let payloads = pieces
            .into_par_iter()
            .zip(types.par_iter())
            .map(|(pieces, &task_type)| match task_type {
                TaskType::Balanced => TaskPayload::concat(pieces),
                TaskType::Unbalanced => TaskPayload::aggregate::<K>(pieces),
            })
            .collect();
        LocalTasks { payloads }
    }
}

/// What this process sends for one task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskPayload {
    /// Supermers: one length per record, then the packed bytes back to back
    Raw {
        /// Length in bases of each supermer
        lengths: Vec<u32>,
        /// Packed bases
        bytes: Vec<u8>,
    },
    /// Locally counted k-mers, as sorted serialized entries
    Aggregated {
        /// Number of entries
        entries: usize,
        /// Serialized entries
        bytes: Vec<u8>,
    },
}

impl TaskPayload {
    fn concat(mut pieces: Vec<(Vec<u32>, Vec<u8>)>) -> Self {
        if pieces.len() == 1 {
            if let Some((lengths, bytes)) = pieces.pop() {
                return TaskPayload::Raw { lengths, bytes };
            }
        }
        let num_lengths = pieces.iter().map(|(l, _)| l.len()).sum();
        let num_bytes = pieces.iter().map(|(_, b)| b.len()).sum();
        let mut lengths = Vec::with_capacity(num_lengths);
        let mut bytes = Vec::with_capacity(num_bytes);
        for (l, b) in pieces {
            lengths.extend_from_slice(&l);
            bytes.extend_from_slice(&b);
        }
        TaskPayload::Raw { lengths, bytes }
    }

    fn aggregate<const K: usize>(pieces: Vec<(Vec<u32>, Vec<u8>)>) -> Self
    where
        Kmer<K>: KmerBits,
    {
        let width = Kmer::<K>::BYTES;
        let mut keys = Vec::new();
        for (lengths, bytes) in &pieces {
            write_seed_keys::<K>(lengths, bytes, &mut keys);
        }
        drop(pieces);
        msd_radix_sort(&mut keys, width, width);

        let mut counted = Vec::new();
        count_sorted_seeds::<K>(&keys, FrequencyBand::UNFILTERED, &mut counted);
        drop(keys);

        let entry_bytes = KmerCount::<K>::ENTRY_BYTES;
        let mut bytes = vec![0u8; counted.len() * entry_bytes];
        for (chunk, entry) in bytes.chunks_exact_mut(entry_bytes).zip(&counted) {
            entry.write_entry(chunk);
        }
        TaskPayload::Aggregated { entries: counted.len(), bytes }
    }

    /// Records sent: supermers for raw payloads, entries for aggregated ones
    pub fn units(&self) -> usize {
        match self {
            TaskPayload::Raw { lengths, .. } => lengths.len(),
            TaskPayload::Aggregated { entries, .. } => *entries,
        }
    }

    /// The bytes sent in the payload stream
    pub fn bytes(&self) -> &[u8] {
        match self {
            TaskPayload::Raw { bytes, .. } | TaskPayload::Aggregated { bytes, .. } => bytes,
        }
    }

    /// Supermer lengths; empty for aggregated payloads
    pub fn lengths(&self) -> &[u32] {
        match self {
            TaskPayload::Raw { lengths, .. } => lengths,
            TaskPayload::Aggregated { .. } => &[],
        }
    }
}

/// Per-task payloads of one process, indexed by task id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalTasks {
    payloads: Vec<TaskPayload>,
}

impl LocalTasks {
    /// Number of tasks
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// True if there are no tasks
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Payload of `task`
    pub fn payload(&self, task: usize) -> &TaskPayload {
        &self.payloads[task]
    }

    /// Records sent for `task`
    pub fn units(&self, task: usize) -> usize {
        self.payloads[task].units()
    }

    /// Supermers over all raw payloads
    pub fn total_supermers(&self) -> usize {
        self.payloads.iter().map(|p| p.lengths().len()).sum()
    }

    /// Payload bytes over all tasks
    pub fn total_bytes(&self) -> usize {
        self.payloads.iter().map(|p| p.bytes().len()).sum()
    }
}
