//! Length and supermer exchanges
//!
//! Three steps move the local payloads to their owners:
//!
//! 1. an all-to-all of per-task record counts, so every owner knows how
//!    many supermers (or entries, for unbalanced tasks) each rank sends;
//! 2. the length exchange, which ships one little-endian `u32` per
//!    supermer of every balanced task;
//! 3. the supermer exchange, which ships the packed supermers and the
//!    serialized entries. The owner sizes its buffers from the lengths
//!    received in step 2.

use std::borrow::Cow;

use rayon::prelude::*;
use tracing::debug;

use super::batched::{BatchedExchange, ExchangePlan, ExchangeStats};
use super::layout::{FixedWidth, RecordQueue};
use crate::comm::{tags, Communicator};
use crate::count::KmerCount;
use crate::dispatcher::{TaskDispatcher, TaskType};
use crate::encoding::packed_len;
use crate::error::CountError;
use crate::kmer::{Kmer, KmerBits};
use crate::parallel_data::LocalTasks;
use crate::sort::RecordBatch;
use crate::supermer::{payload_len, seed_count, write_seed_keys};

const LENGTH_BYTES: usize = 4;

/// Exchange of supermer lengths
pub type LengthExchanger<'a, C> = BatchedExchange<'a, C, FixedWidth>;

/// Exchange of supermer payloads and pre-aggregated entries
pub type SupermerExchanger<'a, C> = BatchedExchange<'a, C, RecordQueue>;

/// Everything this rank received for the tasks it owns
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceivedTasks {
    tasks: Vec<usize>,
    types: Vec<TaskType>,
    lengths: Vec<Vec<u32>>,
    payloads: Vec<Vec<u8>>,
    units: Vec<u64>,
}

impl ReceivedTasks {
    /// Owned tasks, ascending
    pub fn tasks(&self) -> &[usize] {
        &self.tasks
    }

    /// Type of each owned task
    pub fn types(&self) -> &[TaskType] {
        &self.types
    }

    /// Supermer lengths received for owned task `i`; empty if unbalanced
    pub fn lengths(&self, i: usize) -> &[u32] {
        &self.lengths[i]
    }

    /// Payload bytes received for owned task `i`
    pub fn payload(&self, i: usize) -> &[u8] {
        &self.payloads[i]
    }

    /// Supermers or entries received for owned task `i`
    pub fn units(&self, i: usize) -> u64 {
        self.units[i]
    }

    /// Records the owner will sort: one per seed, or one per entry
    pub fn sort_records(&self, k: usize) -> u64 {
        self.types
            .iter()
            .zip(&self.lengths)
            .zip(&self.units)
            .map(|((t, lengths), &units)| match t {
                TaskType::Balanced => seed_count(lengths, k) as u64,
                TaskType::Unbalanced => units,
            })
            .sum()
    }

    /// Turn every owned task into fixed-width records keyed on the k-mer
    ///
    /// Balanced tasks become one key per canonical seed; unbalanced tasks
    /// keep their serialized entries.
    pub fn into_batches<const K: usize>(self) -> Vec<RecordBatch>
    where
        Kmer<K>: KmerBits,
    {
        let key_width = Kmer::<K>::BYTES;
        let entry_width = KmerCount::<K>::ENTRY_BYTES;
        self.types
            .into_par_iter()
            .zip(self.lengths)
            .zip(self.payloads)
            .map(|((task_type, lengths), payload)| match task_type {
                TaskType::Balanced => {
                    let mut keys = Vec::new();
                    write_seed_keys::<K>(&lengths, &payload, &mut keys);
                    RecordBatch::new(keys, key_width, key_width)
                }
                TaskType::Unbalanced => RecordBatch::new(payload, entry_width, key_width),
            })
            .collect()
    }
}

fn decode_lengths(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(LENGTH_BYTES)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Move every local payload to the owner of its task
///
/// `entry_bytes` is the serialized size of an aggregated entry. Returns
/// what this rank received and the merged statistics of both exchanges.
///
/// # Errors
/// Fails if a collective fails or a stream does not match its announced size.
pub fn exchange_tasks<C: Communicator>(
    comm: &C,
    dispatcher: &TaskDispatcher,
    local: &LocalTasks,
    entry_bytes: usize,
    max_batch: usize,
) -> Result<(ReceivedTasks, ExchangeStats), CountError> {
    let nprocs = comm.size();
    let rank = comm.rank();
    let num_tasks = dispatcher.num_tasks();
    let owned = dispatcher.owned(rank).to_vec();
    let types: Vec<TaskType> = owned.iter().map(|&t| dispatcher.task_type(t)).collect();

    let counts: Vec<Vec<u64>> = (0..nprocs)
        .map(|dest| {
            dispatcher
                .owned(dest)
                .iter()
                .map(|&task| local.units(task) as u64)
                .collect()
        })
        .collect();
    let incoming_units = comm.all_to_all_u64(&counts)?;
    for (src, row) in incoming_units.iter().enumerate() {
        if row.len() != owned.len() {
            return Err(CountError::TaskCountMismatch(
                incoming_units.iter().map(|r| r.len() as u64).collect(),
            ));
        }
        debug!("Rank {} announces {:?} records", src, row);
    }

    // Lengths of balanced tasks
    let length_plan = ExchangePlan {
        num_tasks,
        sends: (0..nprocs)
            .map(|dest| {
                dispatcher
                    .owned(dest)
                    .iter()
                    .filter(|&&task| dispatcher.task_type(task) == TaskType::Balanced)
                    .map(|&task| {
                        let bytes: Vec<u8> = local
                            .payload(task)
                            .lengths()
                            .iter()
                            .flat_map(|len| len.to_le_bytes())
                            .collect();
                        (task, Cow::Owned(bytes))
                    })
                    .collect()
            })
            .collect(),
        layouts: vec![FixedWidth(LENGTH_BYTES); nprocs],
        recv_tasks: owned.clone(),
        expected: incoming_units
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&types)
                    .map(|(&units, t)| match t {
                        TaskType::Balanced => units as usize * LENGTH_BYTES,
                        TaskType::Unbalanced => 0,
                    })
                    .collect()
            })
            .collect(),
    };
    let (length_buffers, mut stats) =
        LengthExchanger::new(comm, tags::LENGTHS, max_batch, length_plan).run()?;
    let lengths: Vec<Vec<u32>> = length_buffers.iter().map(|b| decode_lengths(b)).collect();

    // Payload sizes per sender follow from the lengths, which are stored
    // in sender order
    let mut expected = vec![vec![0usize; owned.len()]; nprocs];
    for (slot, task_type) in types.iter().enumerate() {
        let mut offset = 0;
        for src in 0..nprocs {
            let units = incoming_units[src][slot] as usize;
            expected[src][slot] = match task_type {
                TaskType::Balanced => payload_len(&lengths[slot][offset..offset + units]),
                TaskType::Unbalanced => units * entry_bytes,
            };
            if *task_type == TaskType::Balanced {
                offset += units;
            }
        }
    }

    let supermer_plan = ExchangePlan {
        num_tasks,
        sends: (0..nprocs)
            .map(|dest| {
                dispatcher
                    .owned(dest)
                    .iter()
                    .map(|&task| (task, Cow::Borrowed(local.payload(task).bytes())))
                    .collect()
            })
            .collect(),
        layouts: (0..nprocs)
            .map(|dest| {
                let mut queue = RecordQueue::default();
                for &task in dispatcher.owned(dest) {
                    let payload = local.payload(task);
                    match dispatcher.task_type(task) {
                        TaskType::Balanced => {
                            queue.extend(payload.lengths().iter().map(|&len| packed_len(len as usize)))
                        }
                        TaskType::Unbalanced => {
                            queue.extend(std::iter::repeat(entry_bytes).take(payload.units()))
                        }
                    }
                }
                queue
            })
            .collect(),
        recv_tasks: owned.clone(),
        expected,
    };
    let (payloads, payload_stats) =
        SupermerExchanger::new(comm, tags::SUPERMERS, max_batch, supermer_plan).run()?;
    stats.merge(&payload_stats);

    let units = (0..owned.len())
        .map(|slot| incoming_units.iter().map(|row| row[slot]).sum())
        .collect();
    let lengths = lengths
        .into_iter()
        .zip(&types)
        .map(|(l, t)| if *t == TaskType::Balanced { l } else { Vec::new() })
        .collect();

    Ok((ReceivedTasks { tasks: owned, types, lengths, payloads, units }, stats))
}
