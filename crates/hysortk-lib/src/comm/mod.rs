//! Message passing between cooperating processes
//!
//! The pipeline talks to its peers only through [`Communicator`]: tagged,
//! buffered point-to-point messages with FIFO order per (sender, receiver)
//! pair. The collectives used by the pipeline are provided methods built on
//! those two primitives, so an implementation only has to move bytes.
//!
//! Every error is fatal to the run: there are no retries and no partial
//! results.

mod local;

pub use local::{LocalCommunicator, LocalGroup};

use thiserror::Error;

/// Tags of the collectives
pub mod tags {
    /// All-gather payloads
    pub const ALL_GATHER: u32 = 1;
    /// All-to-all payloads
    pub const ALL_TO_ALL: u32 = 2;
    /// Barrier tokens
    pub const BARRIER: u32 = 3;
    /// Length exchange rounds
    pub const LENGTHS: u32 = 16;
    /// Supermer exchange rounds
    pub const SUPERMERS: u32 = 17;
}

/// Errors raised by the communication layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// The peer is gone: its end of the channel was dropped
    #[error("rank {peer} disconnected")]
    Disconnected {
        /// Rank that went away
        peer: usize,
    },
    /// A message arrived with a different tag than the one expected
    #[error("message from rank {peer} has tag {actual}, expected {expected}")]
    TagMismatch {
        /// Sender
        peer: usize,
        /// Tag the receiver waited for
        expected: u32,
        /// Tag the message carried
        actual: u32,
    },
    /// The rank is outside the group
    #[error("rank {rank} is outside a group of {size}")]
    InvalidRank {
        /// Offending rank
        rank: usize,
        /// Group size
        size: usize,
    },
    /// A collective payload could not be decoded
    #[error("malformed payload of {len} bytes from rank {peer}")]
    Malformed {
        /// Sender
        peer: usize,
        /// Payload length
        len: usize,
    },
}

/// A process group with reliable, ordered point-to-point delivery
pub trait Communicator: Sync {
    /// Rank of this process
    fn rank(&self) -> usize;

    /// Number of processes in the group
    fn size(&self) -> usize;

    /// Queue `payload` for `dest`; returns without waiting for the receiver
    fn send(&self, dest: usize, tag: u32, payload: Vec<u8>) -> Result<(), CommError>;

    /// Block until the next message from `src` arrives; it must carry `tag`
    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>, CommError>;

    /// Every rank contributes `local`; returns the contributions by rank
    fn all_gather_u64(&self, local: &[u64]) -> Result<Vec<Vec<u64>>, CommError> {
        let payload = encode_words(local);
        for dest in 0..self.size() {
            self.send(dest, tags::ALL_GATHER, payload.clone())?;
        }
        (0..self.size())
            .map(|src| decode_words(src, &self.recv(src, tags::ALL_GATHER)?))
            .collect()
    }

    /// Send `outgoing[dest]` to every `dest`; returns what each rank sent here
    fn all_to_all_u64(&self, outgoing: &[Vec<u64>]) -> Result<Vec<Vec<u64>>, CommError> {
        if outgoing.len() != self.size() {
            return Err(CommError::InvalidRank { rank: outgoing.len(), size: self.size() });
        }
        for (dest, words) in outgoing.iter().enumerate() {
            self.send(dest, tags::ALL_TO_ALL, encode_words(words))?;
        }
        (0..self.size())
            .map(|src| decode_words(src, &self.recv(src, tags::ALL_TO_ALL)?))
            .collect()
    }

    /// Element-wise sum of equally long vectors over all ranks
    ///
    /// Shorter contributions are treated as zero-padded.
    fn all_reduce_sum_vec(&self, local: &[u64]) -> Result<Vec<u64>, CommError> {
        let gathered = self.all_gather_u64(local)?;
        let len = gathered.iter().map(Vec::len).max().unwrap_or(0);
        let mut total = vec![0u64; len];
        for words in &gathered {
            for (acc, &w) in total.iter_mut().zip(words) {
                *acc += w;
            }
        }
        Ok(total)
    }

    /// Sum of one value over all ranks
    fn all_reduce_sum_u64(&self, value: u64) -> Result<u64, CommError> {
        Ok(self.all_reduce_sum_vec(&[value])?.first().copied().unwrap_or(0))
    }

    /// Maximum of one value over all ranks
    fn all_reduce_max_u64(&self, value: u64) -> Result<u64, CommError> {
        let gathered = self.all_gather_u64(&[value])?;
        Ok(gathered.iter().filter_map(|w| w.first().copied()).max().unwrap_or(0))
    }

    /// Sum of `value` over the ranks below this one
    fn exclusive_scan_sum_u64(&self, value: u64) -> Result<u64, CommError> {
        let gathered = self.all_gather_u64(&[value])?;
        Ok(gathered[..self.rank()]
            .iter()
            .filter_map(|w| w.first().copied())
            .sum())
    }

    /// Return only once every rank has entered the barrier
    fn barrier(&self) -> Result<(), CommError> {
        for dest in 0..self.size() {
            self.send(dest, tags::BARRIER, Vec::new())?;
        }
        for src in 0..self.size() {
            self.recv(src, tags::BARRIER)?;
        }
        Ok(())
    }
}

/// Little-endian encoding of a word vector
pub fn encode_words(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Inverse of [`encode_words`]; `peer` is only used for the error
pub fn decode_words(peer: usize, bytes: &[u8]) -> Result<Vec<u64>, CommError> {
    if bytes.len() % 8 != 0 {
        return Err(CommError::Malformed { peer, len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect())
}
