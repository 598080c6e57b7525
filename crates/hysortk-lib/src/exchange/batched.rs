//! Bounded-round exchange state machine
//!
//! Every rank holds one outgoing stream per peer (itself included): the
//! bytes of the tasks that peer owns, in the order the peer lists them.
//! A round sends one chunk to every peer whose stream is still open,
//! receives and acknowledges one chunk from every peer still sending to
//! us, and then waits for the acknowledgement of every chunk it sent. A
//! sender never has more than one chunk of at most `budget` bytes in
//! flight per receiver, even after its own incoming streams have closed.
//!
//! A chunk is a one-byte header followed by whole records. The header
//! marks the last chunk of a stream. An empty stream is a single header.
//! The receiver knows how many bytes each sender announced for each task
//! and copies incoming bytes straight to their final offset, so a task's
//! buffer holds the senders' data in rank order, each in send order.

use std::borrow::Cow;
use std::collections::VecDeque;

use tracing::debug;

use super::layout::RecordLayout;
use super::ExchangeError;
use crate::comm::Communicator;

const MORE: u8 = 0;
const LAST: u8 = 1;

/// Acknowledgements travel on the exchange tag with this bit set
const ACK_BIT: u32 = 1 << 31;

/// Progress of an exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Streams prepared, nothing sent yet
    Init,
    /// Rounds are running
    InProgress,
    /// Every stream was sent and received in full
    BatchDone,
}

/// What one rank sends and expects in an exchange
#[derive(Clone, Debug)]
pub struct ExchangePlan<'a, L> {
    /// Total number of tasks, for the statistics
    pub num_tasks: usize,
    /// Per destination rank, the `(task, bytes)` pieces of its stream in order
    pub sends: Vec<Vec<(usize, Cow<'a, [u8]>)>>,
    /// Per destination rank, where its stream may be cut
    pub layouts: Vec<L>,
    /// Tasks received here, in the order every sender streams them
    pub recv_tasks: Vec<usize>,
    /// `expected[src][i]`: bytes `src` sends for `recv_tasks[i]`
    pub expected: Vec<Vec<usize>>,
}

/// Byte and message counts of one rank
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Payload bytes sent, by task
    pub sent: Vec<u64>,
    /// Payload bytes received, by task
    pub received: Vec<u64>,
    /// Rounds run
    pub rounds: usize,
    /// Chunks sent
    pub messages: usize,
}

impl ExchangeStats {
    fn new(num_tasks: usize) -> Self {
        Self {
            sent: vec![0; num_tasks],
            received: vec![0; num_tasks],
            rounds: 0,
            messages: 0,
        }
    }

    /// Add the counts of another exchange over the same tasks
    pub fn merge(&mut self, other: &ExchangeStats) {
        if self.sent.len() < other.sent.len() {
            self.sent.resize(other.sent.len(), 0);
            self.received.resize(other.received.len(), 0);
        }
        for (acc, v) in self.sent.iter_mut().zip(&other.sent) {
            *acc += v;
        }
        for (acc, v) in self.received.iter_mut().zip(&other.received) {
            *acc += v;
        }
        self.rounds += other.rounds;
        self.messages += other.messages;
    }

    /// Payload bytes sent over all tasks
    pub fn total_sent(&self) -> u64 {
        self.sent.iter().sum()
    }

    /// Payload bytes received over all tasks
    pub fn total_received(&self) -> u64 {
        self.received.iter().sum()
    }
}

struct Outgoing<'a, L> {
    pieces: VecDeque<Cow<'a, [u8]>>,
    offset: usize,
    remaining: usize,
    layout: L,
    closed: bool,
}

impl<L: RecordLayout> Outgoing<'_, L> {
    fn next_chunk(&mut self, budget: usize) -> Vec<u8> {
        let len = if self.remaining == 0 {
            0
        } else {
            self.layout.next_chunk_len(self.remaining, budget).clamp(1, self.remaining)
        };

        let mut chunk = Vec::with_capacity(len + 1);
        chunk.push(MORE);
        let mut left = len;
        while left > 0 {
            let Some(piece) = self.pieces.front() else {
                break;
            };
            let take = (piece.len() - self.offset).min(left);
            chunk.extend_from_slice(&piece[self.offset..self.offset + take]);
            self.offset += take;
            left -= take;
            if self.offset == piece.len() {
                self.pieces.pop_front();
                self.offset = 0;
            }
        }

        self.remaining -= len;
        if self.remaining == 0 {
            chunk[0] = LAST;
            self.closed = true;
        }
        chunk
    }
}

#[derive(Clone, Copy, Debug)]
struct Segment {
    slot: usize,
    start: usize,
    len: usize,
}

struct Incoming {
    segments: Vec<Segment>,
    segment: usize,
    pos: usize,
    expected: usize,
    received: usize,
    closed: bool,
}

impl Incoming {
    fn accept(
        &mut self,
        src: usize,
        chunk: &[u8],
        buffers: &mut [Vec<u8>],
        recv_tasks: &[usize],
        received: &mut [u64],
    ) -> Result<(), ExchangeError> {
        let Some((&flag, mut data)) = chunk.split_first() else {
            return Err(ExchangeError::EmptyChunk { src });
        };
        if flag != LAST && data.is_empty() {
            return Err(ExchangeError::EmptyChunk { src });
        }
        if self.received + data.len() > self.expected {
            return Err(ExchangeError::Overflow {
                src,
                expected: self.expected,
                received: self.received + data.len(),
            });
        }

        self.received += data.len();
        while !data.is_empty() {
            let seg = self.segments[self.segment];
            let take = (seg.len - self.pos).min(data.len());
            let at = seg.start + self.pos;
            buffers[seg.slot][at..at + take].copy_from_slice(&data[..take]);
            received[recv_tasks[seg.slot]] += take as u64;
            data = &data[take..];
            self.pos += take;
            if self.pos == seg.len {
                self.segment += 1;
                self.pos = 0;
            }
        }

        if flag == LAST {
            self.closed = true;
            if self.received < self.expected {
                return Err(ExchangeError::ShortStream {
                    src,
                    expected: self.expected,
                    received: self.received,
                });
            }
        }
        Ok(())
    }
}

/// One exchange of per-task byte streams between all ranks
pub struct BatchedExchange<'a, C: Communicator + ?Sized, L> {
    comm: &'a C,
    tag: u32,
    budget: usize,
    status: ExchangeStatus,
    outgoing: Vec<Outgoing<'a, L>>,
    incoming: Vec<Incoming>,
    recv_tasks: Vec<usize>,
    buffers: Vec<Vec<u8>>,
    stats: ExchangeStats,
}

impl<'a, C: Communicator + ?Sized, L: RecordLayout> BatchedExchange<'a, C, L> {
    /// Prepare the exchange described by `plan`
    ///
    /// `max_batch` bytes per round are split evenly across the peers.
    ///
    /// # Panics
    /// Panics if the plan does not have one entry per rank in `sends`,
    /// `layouts` and `expected`, or one expected size per received task.
    pub fn new(comm: &'a C, tag: u32, max_batch: usize, plan: ExchangePlan<'a, L>) -> Self {
        let nprocs = comm.size();
        let ExchangePlan { num_tasks, sends, layouts, recv_tasks, expected } = plan;
        assert_eq!(sends.len(), nprocs, "one outgoing stream per rank");
        assert_eq!(layouts.len(), nprocs, "one record layout per rank");
        assert_eq!(expected.len(), nprocs, "one expectation per rank");
        assert!(
            expected.iter().all(|row| row.len() == recv_tasks.len()),
            "one expected size per received task"
        );

        let mut stats = ExchangeStats::new(num_tasks);
        let outgoing = sends
            .into_iter()
            .zip(layouts)
            .map(|(pieces, layout)| {
                for (task, bytes) in &pieces {
                    stats.sent[*task] += bytes.len() as u64;
                }
                let remaining = pieces.iter().map(|(_, b)| b.len()).sum();
                Outgoing {
                    pieces: pieces.into_iter().map(|(_, b)| b).filter(|b| !b.is_empty()).collect(),
                    offset: 0,
                    remaining,
                    layout,
                    closed: false,
                }
            })
            .collect();

        let slot_sizes: Vec<usize> = (0..recv_tasks.len())
            .map(|slot| expected.iter().map(|row| row[slot]).sum())
            .collect();
        let mut slot_fill = vec![0usize; recv_tasks.len()];
        let incoming = expected
            .iter()
            .map(|row| {
                let mut segments = Vec::new();
                for (slot, &len) in row.iter().enumerate() {
                    if len > 0 {
                        segments.push(Segment { slot, start: slot_fill[slot], len });
                        slot_fill[slot] += len;
                    }
                }
                Incoming {
                    segments,
                    segment: 0,
                    pos: 0,
                    expected: row.iter().sum(),
                    received: 0,
                    closed: false,
                }
            })
            .collect();
        let buffers = slot_sizes.iter().map(|&len| vec![0u8; len]).collect();

        Self {
            comm,
            tag,
            budget: (max_batch / nprocs.max(1)).max(1),
            status: ExchangeStatus::Init,
            outgoing,
            incoming,
            recv_tasks,
            buffers,
            stats,
        }
    }

    /// Current state
    pub fn status(&self) -> ExchangeStatus {
        self.status
    }

    /// Bytes sent to one peer per round
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Counts so far
    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Run one round
    ///
    /// # Errors
    /// Fails on any communication error or size mismatch; the exchange is
    /// then unusable.
    pub fn progress(&mut self) -> Result<ExchangeStatus, ExchangeError> {
        match self.status {
            ExchangeStatus::BatchDone => return Ok(ExchangeStatus::BatchDone),
            ExchangeStatus::Init => self.status = ExchangeStatus::InProgress,
            ExchangeStatus::InProgress => {}
        }

        let nprocs = self.comm.size();
        let rank = self.comm.rank();
        let ack_tag = self.tag | ACK_BIT;
        let mut unacked = Vec::with_capacity(nprocs);
        for step in 1..=nprocs {
            let dest = (rank + step) % nprocs;
            let stream = &mut self.outgoing[dest];
            if stream.closed {
                continue;
            }
            let chunk = stream.next_chunk(self.budget);
            self.comm.send(dest, self.tag, chunk)?;
            self.stats.messages += 1;
            unacked.push(dest);
        }

        for step in 0..nprocs {
            let src = (rank + nprocs - step) % nprocs;
            if self.incoming[src].closed {
                continue;
            }
            let chunk = self.comm.recv(src, self.tag)?;
            self.incoming[src].accept(
                src,
                &chunk,
                &mut self.buffers,
                &self.recv_tasks,
                &mut self.stats.received,
            )?;
            self.comm.send(src, ack_tag, Vec::new())?;
        }

        for dest in unacked {
            self.comm.recv(dest, ack_tag)?;
        }

        self.stats.rounds += 1;
        if self.outgoing.iter().all(|s| s.closed) && self.incoming.iter().all(|s| s.closed) {
            self.status = ExchangeStatus::BatchDone;
            debug!(
                "Exchange tag {} done after {} rounds: sent {} bytes, received {} bytes",
                self.tag,
                self.stats.rounds,
                self.stats.total_sent(),
                self.stats.total_received()
            );
        }
        Ok(self.status)
    }

    /// Take the received buffers, one per task of `recv_tasks`
    ///
    /// # Errors
    /// Fails if the exchange has not reached [`ExchangeStatus::BatchDone`].
    pub fn finish(self) -> Result<(Vec<Vec<u8>>, ExchangeStats), ExchangeError> {
        if self.status != ExchangeStatus::BatchDone {
            return Err(ExchangeError::Incomplete(self.status));
        }
        Ok((self.buffers, self.stats))
    }

    /// Call [`progress`](Self::progress) until done, then [`finish`](Self::finish)
    pub fn run(mut self) -> Result<(Vec<Vec<u8>>, ExchangeStats), ExchangeError> {
        while self.progress()? != ExchangeStatus::BatchDone {}
        self.finish()
    }
}
