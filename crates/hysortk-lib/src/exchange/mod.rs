//! Batched exchange of task data between processes
//!
//! [`BatchedExchange`] moves one byte stream per (sender, receiver) pair in
//! rounds of bounded size and demultiplexes what arrives into one buffer
//! per owned task. The length and supermer exchanges are two instances of
//! it that differ only in how a stream is cut into records.

mod batched;
mod layout;
mod supermer;

pub use batched::{BatchedExchange, ExchangePlan, ExchangeStats, ExchangeStatus};
pub use layout::{FixedWidth, RecordLayout, RecordQueue};
pub use supermer::{exchange_tasks, LengthExchanger, ReceivedTasks, SupermerExchanger};

use thiserror::Error;

use crate::comm::CommError;

/// Errors raised while exchanging task data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// A sender delivered more bytes than announced
    #[error("rank {src} sent {received} bytes, only {expected} were expected")]
    Overflow {
        /// Sender
        src: usize,
        /// Bytes announced
        expected: usize,
        /// Bytes received so far
        received: usize,
    },

    /// A sender closed its stream before delivering everything it announced
    #[error("rank {src} closed its stream after {received} of {expected} bytes")]
    ShortStream {
        /// Sender
        src: usize,
        /// Bytes announced
        expected: usize,
        /// Bytes received
        received: usize,
    },

    /// A chunk with neither data nor the end-of-stream mark
    #[error("empty chunk from rank {src}")]
    EmptyChunk {
        /// Sender
        src: usize,
    },

    /// The exchange was finished before reaching its terminal state
    #[error("exchange finished in state {0:?}")]
    Incomplete(ExchangeStatus),

    /// The underlying communicator failed
    #[error(transparent)]
    Comm(#[from] CommError),
}
