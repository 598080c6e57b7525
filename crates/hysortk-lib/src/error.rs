//! Top-level error of a counting run
//!
//! Every variant is fatal: the pipeline stops and the caller gets no
//! partial table.

use thiserror::Error;

use crate::comm::CommError;
use crate::exchange::ExchangeError;
use crate::sort::SortError;

/// Errors returned by [`KmerCounter::count`](crate::pipeline::KmerCounter::count)
#[derive(Error, Debug)]
pub enum CountError {
    /// The configuration was rejected by `validate`
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A collective or point-to-point operation failed
    #[error(transparent)]
    Comm(#[from] CommError),

    /// An exchange stream broke its size accounting
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// A task could not be sorted
    #[error(transparent)]
    Sort(#[from] SortError),

    /// A rank computed a different task assignment than this one
    #[error("rank {rank} computed task assignment {theirs:#018x}, this rank computed {ours:#018x}")]
    DispatchMismatch {
        /// Disagreeing rank
        rank: usize,
        /// Fingerprint computed here
        ours: u64,
        /// Fingerprint computed by `rank`
        theirs: u64,
    },

    /// Ranks disagree on the number of tasks per process
    #[error("ranks disagree on tasks per process: {0:?}")]
    TaskCountMismatch(Vec<u64>),

    /// A rayon pool could not be built
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
