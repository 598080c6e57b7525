//! Minimizer destination finder
//!
//! Every k-mer window of a read is sent to the task chosen by its
//! minimizer: the canonical m-mer with the smallest hash inside the window.
//! A monotonic deque keeps the candidates, so each read costs O(len).
//!
//! Because the minimizer is taken over canonical m-mers, a k-mer and its
//! reverse complement see the same set of m-mer hashes and therefore land
//! in the same task, wherever they occur.

use std::collections::VecDeque;

use crate::encoding::complement_base;
use crate::hasher::DeterministicHasher;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    hash: u64,
    position: usize,
}

/// Sliding-window minimum over canonical m-mer hashes
pub struct MinimizerWindow {
    k: usize,
    m: usize,
    total_tasks: u64,
    hasher: DeterministicHasher,
    deque: VecDeque<Candidate>,
}

impl MinimizerWindow {
    /// Create a finder for k-mers of length `k` and minimizers of length `m`
    ///
    /// # Panics
    /// Panics unless `0 < m < k`, `m <= 32` and `total_tasks > 0`.
    pub fn new(k: usize, m: usize, total_tasks: usize, seed: u64) -> Self {
        assert!(m > 0 && m < k && m <= 32, "need 0 < m < k and m <= 32, got k={k} m={m}");
        assert!(total_tasks > 0, "at least one task is required");
        Self {
            k,
            m,
            total_tasks: total_tasks as u64,
            hasher: DeterministicHasher::new(seed),
            deque: VecDeque::with_capacity(k - m + 1),
        }
    }

    /// Number of destinations a read of `len` bases produces
    #[inline]
    pub fn num_windows(&self, len: usize) -> usize {
        (len + 1).saturating_sub(self.k)
    }

    /// Append one task id per k-mer window of `read` to `out`
    ///
    /// Reads shorter than k append nothing.
    pub fn find_destinations(&mut self, read: &[u8], out: &mut Vec<u32>) {
        let num_windows = self.num_windows(read.len());
        if num_windows == 0 {
            return;
        }
        out.reserve(num_windows);
        self.deque.clear();

        let span = self.k - self.m;
        let mask = if self.m == 32 { u64::MAX } else { (1u64 << (2 * self.m)) - 1 };
        let top = 2 * (self.m - 1);
        let mut fwd = 0u64;
        let mut rev = 0u64;

        for (i, &code) in read.iter().enumerate() {
            let code = (code & 0b11) as u64;
            fwd = (fwd >> 2) | (code << top);
            rev = ((rev << 2) | complement_base(code as u8) as u64) & mask;
            if i + 1 < self.m {
                continue;
            }

            let position = i + 1 - self.m;
            let hash = self.hasher.hash_u64(fwd.min(rev));
            while self.deque.back().is_some_and(|c| c.hash >= hash) {
                self.deque.pop_back();
            }
            self.deque.push_back(Candidate { hash, position });

            if position < span {
                continue;
            }
            let window_start = position - span;
            while self.deque.front().is_some_and(|c| c.position < window_start) {
                self.deque.pop_front();
            }
            if let Some(front) = self.deque.front() {
                out.push((front.hash % self.total_tasks) as u32);
            }
        }
    }
}

/// Destination sequence of a single read
pub fn find_destinations(read: &[u8], k: usize, m: usize, total_tasks: usize, seed: u64) -> Vec<u32> {
    let mut window = MinimizerWindow::new(k, m, total_tasks, seed);
    let mut out = Vec::new();
    window.find_destinations(read, &mut out);
    out
}
