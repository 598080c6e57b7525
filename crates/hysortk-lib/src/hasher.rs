//! Deterministic hasher for minimizers using ahash.
//!
//! Every process must map a minimizer to the same task, so the hasher is
//! built from explicit seeds instead of per-process random state.

use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// A deterministic hasher with a seeded state
#[derive(Clone)]
pub struct DeterministicHasher {
    seed: u64,
    state: RandomState,
}

impl DeterministicHasher {
    /// Create a new deterministic hasher with the given seed
    pub fn new(seed: u64) -> Self {
        let state = RandomState::with_seeds(seed, !seed, seed, !seed);
        Self { seed, state }
    }

    /// Hash a u64 value using a seeded AHasher
    #[inline]
    pub fn hash_u64(&self, value: u64) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u64(value);
        hasher.finish()
    }

    /// Hash a u128 value (k-mers wider than 31 bases)
    #[inline]
    pub fn hash_u128(&self, value: u128) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u128(value);
        hasher.finish()
    }

    /// Hash a sequence of words into one value
    pub fn hash_words(&self, words: impl IntoIterator<Item = u64>) -> u64 {
        let mut hasher = self.state.build_hasher();
        for word in words {
            hasher.write_u64(word);
        }
        hasher.finish()
    }

    /// Get the seed value
    pub fn seed(&self) -> u64 {
        self.seed
    }
}
