//! Task dispatcher
//!
//! Every rank all-gathers the per-task byte estimates of every other rank
//! and runs the same greedy packing over the identical table: tasks sorted
//! by total size (largest first, ties by id) each go to the least-loaded
//! rank (ties to the rank owning fewer tasks, then the lowest rank). Nothing else is exchanged, so the result
//! is agreed on by construction; a fingerprint all-gather checks it anyway.
//!
//! Greedy packing is not optimal. A single task larger than the mean rank
//! load still lands on one rank, and the hash-modulo task mapping does not
//! spread a highly repetitive minimizer. Tasks far above the mean are
//! marked [`TaskType::Unbalanced`] so their senders pre-aggregate them,
//! which bounds their exchange and sort volume by the number of distinct
//! k-mers instead of occurrences.

use std::cmp::Reverse;

use tracing::{debug, info};

use crate::comm::Communicator;
use crate::constants::DEFAULT_SEED;
use crate::error::CountError;
use crate::hasher::DeterministicHasher;

/// How a task is shipped and counted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Raw supermers are sent; the owner extracts, sorts and counts seeds
    #[default]
    Balanced,
    /// Each sender counts its own seeds; the owner merges (k-mer, count) entries
    Unbalanced,
}

impl TaskType {
    /// Wire tag: 0 for balanced, 1 for unbalanced
    pub fn tag(self) -> u8 {
        match self {
            TaskType::Balanced => 0,
            TaskType::Unbalanced => 1,
        }
    }
}

/// Agreed owner and type of every task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDispatcher {
    owners: Vec<usize>,
    types: Vec<TaskType>,
    owned: Vec<Vec<usize>>,
    loads: Vec<u64>,
    totals: Vec<u64>,
}

impl TaskDispatcher {
    /// Assign tasks given `gathered[rank][task]` byte estimates
    ///
    /// Pure and deterministic: equal inputs give equal assignments.
    ///
    /// # Panics
    /// Panics if `gathered` is empty or its rows differ in length.
    pub fn from_gathered(gathered: &[Vec<u64>], unbalanced_ratio: f64) -> Self {
        let nprocs = gathered.len();
        assert!(nprocs > 0, "dispatching over an empty group");
        let num_tasks = gathered[0].len();
        assert!(
            gathered.iter().all(|row| row.len() == num_tasks),
            "task size vectors differ in length"
        );

        let totals: Vec<u64> = (0..num_tasks)
            .map(|task| gathered.iter().map(|row| row[task]).sum())
            .collect();

        let mut order: Vec<usize> = (0..num_tasks).collect();
        order.sort_by_key(|&task| (Reverse(totals[task]), task));

        let mut owners = vec![0usize; num_tasks];
        let mut loads = vec![0u64; nprocs];
        let mut owned = vec![Vec::new(); nprocs];
        for task in order {
            let rank = (0..nprocs)
                .min_by_key(|&rank| (loads[rank], owned[rank].len(), rank))
                .unwrap_or(0);
            owners[task] = rank;
            loads[rank] += totals[task];
            owned[rank].push(task);
        }
        for tasks in &mut owned {
            tasks.sort_unstable();
        }

        let grand_total: u64 = totals.iter().sum();
        let mean = if num_tasks == 0 { 0.0 } else { grand_total as f64 / num_tasks as f64 };
        let threshold = unbalanced_ratio * mean;
        let types = totals
            .iter()
            .map(|&total| {
                if total > 0 && total as f64 > threshold {
                    TaskType::Unbalanced
                } else {
                    TaskType::Balanced
                }
            })
            .collect();

        Self { owners, types, owned, loads, totals }
    }

    /// Number of tasks over all ranks
    pub fn num_tasks(&self) -> usize {
        self.owners.len()
    }

    /// Number of ranks
    pub fn nprocs(&self) -> usize {
        self.loads.len()
    }

    /// Rank owning `task`
    #[inline]
    pub fn owner(&self, task: usize) -> usize {
        self.owners[task]
    }

    /// Type of `task`
    #[inline]
    pub fn task_type(&self, task: usize) -> TaskType {
        self.types[task]
    }

    /// Types of all tasks, by task id
    pub fn types(&self) -> &[TaskType] {
        &self.types
    }

    /// Tasks owned by `rank`, ascending
    pub fn owned(&self, rank: usize) -> &[usize] {
        &self.owned[rank]
    }

    /// Estimated bytes each rank receives
    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    /// Estimated bytes of each task over all ranks
    pub fn totals(&self) -> &[u64] {
        &self.totals
    }

    /// Number of unbalanced tasks
    pub fn num_unbalanced(&self) -> usize {
        self.types.iter().filter(|&&t| t == TaskType::Unbalanced).count()
    }

    /// Hash of the (owner, type) table, equal on every rank that agrees
    pub fn fingerprint(&self) -> u64 {
        let hasher = DeterministicHasher::new(DEFAULT_SEED);
        hasher.hash_words(
            self.owners
                .iter()
                .zip(&self.types)
                .map(|(&owner, t)| ((owner as u64) << 1) | u64::from(t.tag())),
        )
    }
}

/// All-gather the local task sizes and compute the agreed assignment
///
/// # Errors
/// Fails if a collective fails, if ranks report different task counts, or
/// if any rank ends up with a different assignment.
pub fn balanced_dispatch<C: Communicator + ?Sized>(
    comm: &C,
    local_sizes: &[u64],
    unbalanced_ratio: f64,
) -> Result<TaskDispatcher, CountError> {
    let gathered = comm.all_gather_u64(local_sizes)?;
    if gathered.iter().any(|row| row.len() != local_sizes.len()) {
        return Err(CountError::TaskCountMismatch(
            gathered.iter().map(|row| row.len() as u64).collect(),
        ));
    }

    let dispatcher = TaskDispatcher::from_gathered(&gathered, unbalanced_ratio);
    check_agreement(comm, dispatcher.fingerprint())?;

    let loads = dispatcher.loads();
    let max_load = loads.iter().copied().max().unwrap_or(0);
    let min_load = loads.iter().copied().min().unwrap_or(0);
    info!(
        "Dispatched {} tasks over {} ranks: {} unbalanced, load min {} max {} bytes",
        dispatcher.num_tasks(),
        dispatcher.nprocs(),
        dispatcher.num_unbalanced(),
        min_load,
        max_load
    );
    debug!(
        "Rank {} owns tasks {:?}",
        comm.rank(),
        dispatcher.owned(comm.rank())
    );
    Ok(dispatcher)
}

/// Fail unless every rank reports the same fingerprint
pub(crate) fn check_agreement<C: Communicator + ?Sized>(comm: &C, fingerprint: u64) -> Result<(), CountError> {
    let gathered = comm.all_gather_u64(&[fingerprint])?;
    for (rank, row) in gathered.iter().enumerate() {
        let theirs = row.first().copied().unwrap_or_default();
        if theirs != fingerprint {
            return Err(CountError::DispatchMismatch { rank, ours: fingerprint, theirs });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;

    #[test]
    fn test_greedy_assignment() {
        // totals: [10, 40, 30, 20]
        let gathered = vec![vec![5, 20, 10, 10], vec![5, 20, 20, 10]];
        let d = TaskDispatcher::from_gathered(&gathered, 8.0);
        assert_eq!(d.totals(), &[10, 40, 30, 20]);
        // 40 -> r0, 30 -> r1, 20 -> r1, 10 -> r0
        assert_eq!(d.owner(1), 0);
        assert_eq!(d.owner(2), 1);
        assert_eq!(d.owner(3), 1);
        assert_eq!(d.owner(0), 0);
        assert_eq!(d.owned(0), &[0, 1]);
        assert_eq!(d.owned(1), &[2, 3]);
        assert_eq!(d.loads(), &[50, 50]);
    }

    #[test]
    fn test_ties_go_to_lowest_id_and_rank() {
        let gathered = vec![vec![0; 6]; 3];
        let d = TaskDispatcher::from_gathered(&gathered, 8.0);
        assert_eq!(d.owned(0), &[0, 3]);
        assert_eq!(d.owned(1), &[1, 4]);
        assert_eq!(d.owned(2), &[2, 5]);
        assert_eq!(d.num_unbalanced(), 0);
    }

    #[test]
    fn test_deterministic() {
        let gathered: Vec<Vec<u64>> = (0..4u64)
            .map(|r| (0..24u64).map(|t| (t * 7919 + r * 104_729) % 1000).collect())
            .collect();
        let a = TaskDispatcher::from_gathered(&gathered, 2.0);
        let b = TaskDispatcher::from_gathered(&gathered, 2.0);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        let owned: usize = (0..4).map(|r| a.owned(r).len()).sum();
        assert_eq!(owned, 24);
    }

    #[test]
    fn test_unbalanced_classification() {
        // mean = 100, so only task 0 exceeds 2x the mean
        let gathered = vec![vec![370, 10, 10, 10]];
        let d = TaskDispatcher::from_gathered(&gathered, 2.0);
        assert_eq!(
            d.types(),
            &[TaskType::Unbalanced, TaskType::Balanced, TaskType::Balanced, TaskType::Balanced]
        );

        let flat = TaskDispatcher::from_gathered(&[vec![5, 5, 5]], 1.0);
        assert_eq!(flat.num_unbalanced(), 0);
        let empty = TaskDispatcher::from_gathered(&[vec![0, 0]], 1.0);
        assert_eq!(empty.num_unbalanced(), 0);
    }

    #[test]
    fn test_fingerprint_tracks_types() {
        let gathered = vec![vec![370, 10, 10, 10]];
        let a = TaskDispatcher::from_gathered(&gathered, 2.0);
        let b = TaskDispatcher::from_gathered(&gathered, 8.0);
        assert_eq!(a.owned(0), b.owned(0));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_dispatch_agrees_across_ranks() {
        let results = LocalGroup::run(3, |comm| {
            let local: Vec<u64> = (0..9u64).map(|t| (t + 1) * (comm.rank() as u64 + 1)).collect();
            balanced_dispatch(comm, &local, 8.0).map(|d| d.fingerprint())
        });
        let prints: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(prints.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_task_count_mismatch() {
        let results = LocalGroup::run(2, |comm| {
            let local = vec![1u64; 3 + comm.rank()];
            balanced_dispatch(comm, &local, 8.0)
        });
        for result in results {
            assert!(matches!(result, Err(CountError::TaskCountMismatch(ref lens)) if lens == &vec![3, 4]));
        }
    }

    #[test]
    fn test_disagreement_is_fatal() {
        let results = LocalGroup::run(2, |comm| check_agreement(comm, 40 + comm.rank() as u64));
        assert!(matches!(
            results[0],
            Err(CountError::DispatchMismatch { rank: 1, ours: 40, theirs: 41 })
        ));
        assert!(matches!(
            results[1],
            Err(CountError::DispatchMismatch { rank: 0, ours: 41, theirs: 40 })
        ));
    }
}
