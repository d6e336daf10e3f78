use std::collections::VecDeque;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use crossbeam::utils::Backoff;
use spin::Mutex;

use super::{ring_all_gather, Bootstrap, BootstrapError};

struct Message {
    from: usize,
    tag: u32,
    data: Vec<u8>,
}

struct Mailbox {
    inbox: Receiver<Message>,
    // arrived, not yet taken by a matching recv
    unexpected: VecDeque<Message>,
}

/// Bootstrap for ranks that are threads of one process.
pub struct LocalBootstrap {
    rank: usize,
    num_ranks: usize,
    num_ranks_per_node: usize,
    peers: Vec<Sender<Message>>,
    mailbox: Mutex<Mailbox>,
}

impl LocalBootstrap {
    /// Creates the bootstrap endpoints of all ranks, indexed by rank.
    pub fn create(num_ranks: usize, num_ranks_per_node: usize) -> Vec<LocalBootstrap> {
        assert!(num_ranks > 0 && num_ranks_per_node > 0);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_ranks)
            .map(|_| crossbeam::channel::unbounded::<Message>())
            .unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalBootstrap {
                rank,
                num_ranks,
                num_ranks_per_node,
                peers: senders.clone(),
                mailbox: Mutex::new(Mailbox {
                    inbox,
                    unexpected: VecDeque::new(),
                }),
            })
            .collect()
    }

    // Moves every arrived message into the mailbox and takes the oldest one
    // matching `peer` and `tag`.
    fn try_take(&self, peer: usize, tag: u32) -> Result<Option<Vec<u8>>, BootstrapError> {
        let mut mailbox = self.mailbox.lock();
        loop {
            match mailbox.inbox.try_recv() {
                Ok(message) => mailbox.unexpected.push_back(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(BootstrapError::Disconnected(peer)),
            }
        }
        let idx = mailbox
            .unexpected
            .iter()
            .position(|m| m.from == peer && m.tag == tag);
        Ok(idx
            .and_then(|idx| mailbox.unexpected.remove(idx))
            .map(|message| message.data))
    }

    fn check_peer(&self, peer: usize) -> Result<(), BootstrapError> {
        if peer >= self.num_ranks {
            return Err(BootstrapError::InvalidPeer(peer));
        }
        Ok(())
    }
}

impl Bootstrap for LocalBootstrap {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn num_ranks_per_node(&self) -> usize {
        self.num_ranks_per_node
    }

    fn send(&self, data: &[u8], peer: usize, tag: u32) -> Result<(), BootstrapError> {
        self.check_peer(peer)?;
        log::trace!(
            "Bootstrap rank {} send {} bytes to peer {} tag {}",
            self.rank,
            data.len(),
            peer,
            tag
        );
        let message = Message {
            from: self.rank,
            tag,
            data: data.to_vec(),
        };
        self.peers[peer]
            .send(message)
            .map_err(|_| BootstrapError::Disconnected(peer))
    }

    // Polls so that threads receiving from other peers or tags are not
    // blocked behind this one.
    fn recv(&self, peer: usize, tag: u32) -> Result<Vec<u8>, BootstrapError> {
        self.check_peer(peer)?;
        let backoff = Backoff::new();
        loop {
            if let Some(data) = self.try_take(peer, tag)? {
                log::trace!(
                    "Bootstrap rank {} recv {} bytes from peer {} tag {}",
                    self.rank,
                    data.len(),
                    peer,
                    tag
                );
                return Ok(data);
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
    }

    fn all_gather(&self, data: &mut [u8], size: usize) -> Result<(), BootstrapError> {
        ring_all_gather(self, data, size)
    }
}
