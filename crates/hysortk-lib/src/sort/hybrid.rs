//! Per-task hybrid sorting on a shared work queue
//!
//! [`HybridSorter::sort_all`] spawns one worker per `threads_per_worker`
//! threads. Workers pull tasks from a [`TaskQueue`] and sort each one in
//! its own rayon pool, sized from the workers still running when the task
//! was claimed.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use super::aligned::{AlignedRecords, ScratchBuffer};
use super::decision::SortStrategy;
use super::lsd::aligned_radix_sort;
use super::msd::msd_radix_sort;
use super::queue::TaskQueue;
use super::SortError;

/// Unsorted fixed-width records of one task
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordBatch {
    /// Records, back to back
    pub bytes: Vec<u8>,
    /// Bytes per record
    pub width: usize,
    /// Leading bytes of a record that form the sort key
    pub key_width: usize,
}

impl RecordBatch {
    /// Wrap `bytes` as records of `width` bytes keyed on the first `key_width`
    pub fn new(bytes: Vec<u8>, width: usize, key_width: usize) -> Self {
        Self { bytes, width, key_width }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        if self.width == 0 { 0 } else { self.bytes.len() / self.width }
    }

    /// True if there are no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sorted records, possibly preceded by stale padding
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortedBatch {
    bytes: Vec<u8>,
    width: usize,
    start: usize,
    len: usize,
}

impl SortedBatch {
    /// Records `start..start + len` of `bytes` are the sorted output
    pub fn with_offset(bytes: Vec<u8>, width: usize, start: usize, len: usize) -> Self {
        debug_assert!((start + len) * width <= bytes.len());
        Self { bytes, width, start, len }
    }

    /// A buffer sorted in place, with no padding
    pub fn unpadded(bytes: Vec<u8>, width: usize) -> Self {
        let len = if width == 0 { 0 } else { bytes.len() / width };
        Self { bytes, width, start: 0, len }
    }

    /// First record of the sorted output
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of sorted records
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if there are no records
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes per record
    pub fn width(&self) -> usize {
        self.width
    }

    /// The sorted records, without padding
    pub fn records(&self) -> &[u8] {
        &self.bytes[self.start * self.width..(self.start + self.len) * self.width]
    }
}

/// Runs per-task sorts with a fixed strategy on a worker pool
#[derive(Clone, Debug)]
pub struct HybridSorter {
    strategy: SortStrategy,
    workers: usize,
    total_threads: usize,
    alignment: usize,
}

impl HybridSorter {
    /// Sorter using `total_threads` threads split into workers of `threads_per_worker`
    pub fn new(strategy: SortStrategy, total_threads: usize, threads_per_worker: usize, alignment: usize) -> Self {
        let total_threads = total_threads.max(1);
        Self {
            strategy,
            workers: (total_threads / threads_per_worker.max(1)).max(1),
            total_threads,
            alignment,
        }
    }

    /// Strategy applied to every task
    pub fn strategy(&self) -> SortStrategy {
        self.strategy
    }

    /// Number of sort workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Sort every batch; output `i` corresponds to input `i`
    ///
    /// # Errors
    /// Returns the first error any worker hit.
    pub fn sort_all(&self, batches: Vec<RecordBatch>) -> Result<Vec<SortedBatch>, SortError> {
        let num_tasks = batches.len();
        if num_tasks == 0 {
            return Ok(Vec::new());
        }
        let inputs: Vec<Mutex<Option<RecordBatch>>> =
            batches.into_iter().map(|b| Mutex::new(Some(b))).collect();
        let outputs: Vec<Mutex<Option<SortedBatch>>> =
            (0..num_tasks).map(|_| Mutex::new(None)).collect();

        let workers = self.workers.min(num_tasks);
        let queue = TaskQueue::new(num_tasks, workers, self.total_threads);
        debug!(
            "Sorting {} tasks with {} workers, strategy {:?}",
            num_tasks, workers, self.strategy
        );

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| self.run_worker(&queue, &inputs, &outputs)))
                .collect();
            for handle in handles {
                handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e))?;
            }
            Ok::<(), SortError>(())
        })?;

        outputs
            .into_iter()
            .enumerate()
            .map(|(task, slot)| {
                slot.into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .ok_or(SortError::Incomplete(task))
            })
            .collect()
    }

    fn run_worker(
        &self,
        queue: &TaskQueue,
        inputs: &[Mutex<Option<RecordBatch>>],
        outputs: &[Mutex<Option<SortedBatch>>],
    ) -> Result<(), SortError> {
        let result = (|| -> Result<(), SortError> {
            while let Some(task) = queue.claim() {
                let threads = queue.threads_per_task();
                let batch = inputs[task]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_default();
                let sorted = self.sort_batch(batch, threads)?;
                *outputs[task].lock().unwrap_or_else(PoisonError::into_inner) = Some(sorted);
            }
            Ok(())
        })();
        queue.worker_finished();
        result
    }

    /// Sort one batch on a pool of `threads` threads
    ///
    /// With the aligned strategy, a batch that cannot be padded to the
    /// boundary falls back to the in-place sort.
    ///
    /// # Errors
    /// Returns an error if the batch is ragged or the pool cannot be built.
    pub fn sort_batch(&self, batch: RecordBatch, threads: usize) -> Result<SortedBatch, SortError> {
        let RecordBatch { bytes, width, key_width } = batch;
        if width == 0 || bytes.len() % width != 0 {
            return Err(SortError::RaggedBuffer { len: bytes.len(), width });
        }
        if bytes.len() <= width {
            return Ok(SortedBatch::unpadded(bytes, width));
        }

        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;
        let bytes = match self.strategy {
            SortStrategy::InPlace => bytes,
            SortStrategy::Aligned => match AlignedRecords::new(bytes, width, self.alignment) {
                Ok(mut aligned) => {
                    let mut scratch = ScratchBuffer::zeroed(aligned.window_bytes(), self.alignment);
                    pool.install(|| {
                        aligned_radix_sort(
                            aligned.window_mut(),
                            scratch.as_mut_slice(),
                            width,
                            key_width,
                            self.alignment,
                        )
                    })?;
                    return Ok(aligned.into_sorted());
                }
                Err(bytes) => {
                    debug!(
                        "Record width {} cannot be aligned to {} bytes, sorting in place",
                        width, self.alignment
                    );
                    bytes
                }
            },
        };

        let mut bytes = bytes;
        pool.install(|| msd_radix_sort(&mut bytes, width, key_width));
        Ok(SortedBatch::unpadded(bytes, width))
    }
}
