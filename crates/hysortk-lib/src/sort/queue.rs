//! Shared queue of pending sort tasks
//!
//! Workers claim task indices from an atomic cursor until it runs past the
//! end. Each claim is given `total_threads / live_workers` threads, so the
//! workers still busy with large tasks get the threads of those that ran
//! out of work.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic work queue over task indices `0..len`
#[derive(Debug)]
pub struct TaskQueue {
    next: AtomicUsize,
    len: usize,
    live_workers: AtomicUsize,
    total_threads: usize,
}

impl TaskQueue {
    /// Queue of `len` tasks shared by `workers` workers and `total_threads` threads
    pub fn new(len: usize, workers: usize, total_threads: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            len,
            live_workers: AtomicUsize::new(workers.max(1)),
            total_threads: total_threads.max(1),
        }
    }

    /// Number of tasks in the queue
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if there are no tasks at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claim the next unclaimed task
    pub fn claim(&self) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        (index < self.len).then_some(index)
    }

    /// Threads to use for a task claimed now
    pub fn threads_per_task(&self) -> usize {
        let live = self.live_workers.load(Ordering::Acquire).max(1);
        (self.total_threads / live).max(1)
    }

    /// Workers that have not yet run out of tasks
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// Record that a worker found the queue empty and stopped
    ///
    /// # Panics
    /// In debug builds, panics if more workers finish than were started.
    pub fn worker_finished(&self) {
        let updated = self
            .live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| live.checked_sub(1));
        debug_assert!(updated.is_ok(), "more sort workers finished than were started");
    }
}
