//! Radix sorting of fixed-width byte records
//!
//! Records are sorted by their first `key_width` bytes, compared as
//! unsigned big-endian strings. Two strategies are available:
//!
//! - [`msd_radix_sort`]: in-place American-flag MSD sort. Works on any
//!   buffer and needs no extra memory.
//! - [`aligned_radix_sort`]: LSD sort that ping-pongs between the input and
//!   a zeroed scratch buffer of the same size. Both must start on a
//!   [`SORT_ALIGNMENT`](crate::constants::SORT_ALIGNMENT) boundary, which
//!   [`AlignedRecords`] arranges by padding with duplicate records.
//!
//! [`sort_decision`] picks one strategy per process from free memory, and
//! [`HybridSorter`] runs a set of per-task sorts on a shared [`TaskQueue`].

mod aligned;
mod decision;
mod hybrid;
mod lsd;
mod msd;
mod queue;

pub use aligned::{padding_records, AlignedRecords, ScratchBuffer};
pub use decision::{
    available_memory_bytes, choose_strategy, procs_per_node_from_env, sort_decision, SortPolicy,
    SortStrategy,
};
pub use hybrid::{HybridSorter, RecordBatch, SortedBatch};
pub use lsd::aligned_radix_sort;
pub use msd::msd_radix_sort;
pub use queue::TaskQueue;

use thiserror::Error;

/// Errors raised by the sorting layer
#[derive(Error, Debug)]
pub enum SortError {
    /// A buffer handed to the aligned sort does not start on the boundary
    #[error("buffer at {addr:#x} is not aligned to {alignment} bytes")]
    Misaligned {
        /// Start address of the buffer
        addr: usize,
        /// Required alignment
        alignment: usize,
    },
    /// The scratch buffer is smaller than the data
    #[error("scratch buffer holds {actual} bytes, {needed} needed")]
    ScratchTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },
    /// The buffer length is not a whole number of records
    #[error("buffer of {len} bytes is not a multiple of the record width {width}")]
    RaggedBuffer {
        /// Buffer length in bytes
        len: usize,
        /// Record width in bytes
        width: usize,
    },
    /// A task finished without producing output
    #[error("sort task {0} produced no output")]
    Incomplete(usize),
    /// The per-task thread pool could not be built
    #[error("failed to build sort thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// True if the records of `data` are in ascending key order
pub fn is_sorted(data: &[u8], width: usize, key_width: usize) -> bool {
    data.chunks_exact(width)
        .zip(data.chunks_exact(width).skip(1))
        .all(|(a, b)| a[..key_width] <= b[..key_width])
}
