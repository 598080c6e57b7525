// HySortK: distributed k-mer counting
//
// A Rust implementation of the HySortK counting pipeline: supermer
// partitioning, load-balanced task exchange and hybrid radix sorting.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod comm;
pub mod config;
pub mod constants;
pub mod count;
pub mod dispatcher;
pub mod encoding;
pub mod error;
pub mod exchange;
pub mod hasher;
pub mod kmer;
pub mod minimizer;
pub mod parallel_data;
pub mod pipeline;
pub mod reads;
pub mod sort;
pub mod supermer;

// Re-export common types at crate root
pub use comm::{CommError, Communicator, LocalCommunicator, LocalGroup};
pub use config::CountConfig;
pub use count::{kmer_histogram, FrequencyBand, KmerCount};
pub use dispatcher::{TaskDispatcher, TaskType};
pub use error::CountError;
pub use kmer::{Kmer, KmerBits};
pub use pipeline::{CountOutput, CountStats, KmerCounter};
pub use reads::{DnaBuffer, ReadSource};
pub use sort::{SortPolicy, SortStrategy};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}
