//! In-process process group
//!
//! Simulates `size` ranks as threads of one process, with one unbounded
//! crossbeam channel per ordered (sender, receiver) pair. Dropping a
//! communicator drops its senders, so a peer that exits or panics turns
//! into [`CommError::Disconnected`] on the other side instead of a hang.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{CommError, Communicator};

struct Envelope {
    tag: u32,
    payload: Vec<u8>,
}

/// One rank of a [`LocalGroup`]
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    outboxes: Vec<Sender<Envelope>>,
    inboxes: Vec<Receiver<Envelope>>,
}

/// Constructors for groups of [`LocalCommunicator`]s
pub struct LocalGroup;

impl LocalGroup {
    /// Create a fully connected group of `size` ranks
    pub fn new(size: usize) -> Vec<LocalCommunicator> {
        let mut outboxes: Vec<Vec<Sender<Envelope>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut inboxes: Vec<Vec<Receiver<Envelope>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = unbounded();
                outboxes[src].push(tx);
                inboxes[dst].push(rx);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalCommunicator { rank, size, outboxes, inboxes })
            .collect()
    }

    /// Run `f` on every rank of a new group, one thread per rank
    ///
    /// Results are returned in rank order.
    ///
    /// # Panics
    /// Re-raises a panic from any rank.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&LocalCommunicator) -> T + Sync,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = Self::new(size)
                .into_iter()
                .map(|comm| scope.spawn(move || f(&comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, tag: u32, payload: Vec<u8>) -> Result<(), CommError> {
        let outbox = self
            .outboxes
            .get(dest)
            .ok_or(CommError::InvalidRank { rank: dest, size: self.size })?;
        outbox
            .send(Envelope { tag, payload })
            .map_err(|_| CommError::Disconnected { peer: dest })
    }

    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>, CommError> {
        let inbox = self
            .inboxes
            .get(src)
            .ok_or(CommError::InvalidRank { rank: src, size: self.size })?;
        let envelope = inbox.recv().map_err(|_| CommError::Disconnected { peer: src })?;
        if envelope.tag != tag {
            return Err(CommError::TagMismatch { peer: src, expected: tag, actual: envelope.tag });
        }
        Ok(envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_to_point_is_fifo() {
        let results = LocalGroup::run(2, |comm| -> Result<Vec<u8>, CommError> {
            if comm.rank() == 0 {
                for i in 0..10u8 {
                    comm.send(1, 7, vec![i])?;
                }
                Ok(Vec::new())
            } else {
                (0..10).map(|_| comm.recv(0, 7).map(|m| m[0])).collect()
            }
        });
        assert_eq!(results[1], Ok((0..10).collect::<Vec<u8>>()));
    }

    #[test]
    fn test_tag_mismatch_is_an_error() {
        let comms = LocalGroup::new(1);
        comms[0].send(0, 1, vec![1]).unwrap();
        assert_eq!(
            comms[0].recv(0, 2),
            Err(CommError::TagMismatch { peer: 0, expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_dropped_peer_disconnects() {
        let mut comms = LocalGroup::new(2);
        let survivor = comms.remove(0);
        drop(comms);
        assert_eq!(survivor.recv(1, 0), Err(CommError::Disconnected { peer: 1 }));
        assert_eq!(survivor.send(1, 0, Vec::new()), Err(CommError::Disconnected { peer: 1 }));
    }

    #[test]
    fn test_invalid_rank() {
        let comms = LocalGroup::new(1);
        assert_eq!(
            comms[0].send(3, 0, Vec::new()),
            Err(CommError::InvalidRank { rank: 3, size: 1 })
        );
    }
}
