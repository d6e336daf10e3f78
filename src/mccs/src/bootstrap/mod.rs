//! Out-of-band messaging among ranks, used only while setting up.

pub mod local;
pub mod tcp;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalBootstrap;
pub use tcp::{spawn_root, TcpBootstrap};

/// Tags at or above this value are reserved for collectives.
pub const RESERVED_TAG_BASE: u32 = 0xffff_0000;
pub(crate) const ALL_GATHER_TAG: u32 = RESERVED_TAG_BASE;
pub(crate) const BARRIER_TAG: u32 = RESERVED_TAG_BASE + 1;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bootstrap root received inconsistent rank count of {0} vs {1}")]
    NumRanksMismatch(usize, usize),
    #[error("Bootstrap root received duplicate check-in from rank {0}")]
    DuplicatedCheckIn(usize),
    #[error("Bootstrap root received incorrect rank number {0}")]
    RankOverflow(usize),
    #[error("Peer rank {0} out of range")]
    InvalidPeer(usize),
    #[error("All-gather buffer of {0} bytes does not hold {1} slots of {2} bytes")]
    AllGatherSize(usize, usize, usize),
    #[error("Bootstrap peer {0} hung up")]
    Disconnected(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapHandle {
    pub addr: SocketAddr,
    pub magic: u64,
}

/// Blocking, tag-matched messaging among `num_ranks` processes.
///
/// Every `send(data, peer, tag)` must be matched by a `recv(me, tag)` on
/// `peer`; messages from the same sender with the same tag are delivered
/// in order.
pub trait Bootstrap: Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    fn num_ranks_per_node(&self) -> usize;

    fn send(&self, data: &[u8], peer: usize, tag: u32) -> Result<(), BootstrapError>;

    fn recv(&self, peer: usize, tag: u32) -> Result<Vec<u8>, BootstrapError>;

    /// `data` holds `num_ranks` slots of `size` bytes, the caller's own slot filled.
    fn all_gather(&self, data: &mut [u8], size: usize) -> Result<(), BootstrapError>;

    // dissemination barrier: log2(n) rounds of send-right, recv-left
    fn barrier(&self) -> Result<(), BootstrapError> {
        let rank = self.rank();
        let num_ranks = self.num_ranks();
        let mut mask = 1;
        while mask < num_ranks {
            let src = (rank + num_ranks - mask) % num_ranks;
            let dst = (rank + mask) % num_ranks;
            self.send(&[0u8], dst, BARRIER_TAG)?;
            self.recv(src, BARRIER_TAG)?;
            mask <<= 1;
        }
        log::trace!("Bootstrap barrier done: rank {} of {}", rank, num_ranks);
        Ok(())
    }
}

pub(crate) fn check_all_gather_size(
    data: &[u8],
    size: usize,
    num_ranks: usize,
) -> Result<(), BootstrapError> {
    if data.len() != size * num_ranks {
        return Err(BootstrapError::AllGatherSize(data.len(), num_ranks, size));
    }
    Ok(())
}

/// Ring all-gather over point-to-point messages on the reserved tag.
pub(crate) fn ring_all_gather<B: Bootstrap + ?Sized>(
    bootstrap: &B,
    data: &mut [u8],
    size: usize,
) -> Result<(), BootstrapError> {
    let rank = bootstrap.rank();
    let num_ranks = bootstrap.num_ranks();
    check_all_gather_size(data, size, num_ranks)?;
    let next = (rank + 1) % num_ranks;
    let prev = (rank + num_ranks - 1) % num_ranks;
    for i in 0..(num_ranks - 1) {
        let recv_slice_idx = (rank + num_ranks - i - 1) % num_ranks;
        let send_slice_idx = (rank + num_ranks - i) % num_ranks;
        // send slice to the right
        let send_data = &data[send_slice_idx * size..(send_slice_idx + 1) * size];
        bootstrap.send(send_data, next, ALL_GATHER_TAG)?;
        // recv slice from the left
        let recv_data = bootstrap.recv(prev, ALL_GATHER_TAG)?;
        if recv_data.len() != size {
            return Err(BootstrapError::AllGatherSize(recv_data.len(), 1, size));
        }
        data[recv_slice_idx * size..(recv_slice_idx + 1) * size].copy_from_slice(&recv_data);
    }
    log::trace!(
        "Bootstrap AllGather done: rank {} of {}, size: {}",
        rank,
        num_ranks,
        size
    );
    Ok(())
}
