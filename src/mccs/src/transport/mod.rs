pub mod connection;
pub mod fabric;

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use connection::{Connection, IbConnection, IpcConnection};

pub const NUM_IB_TRANSPORTS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Transport {
    CudaIpc = 0,
    Ib0,
    Ib1,
    Ib2,
    Ib3,
    Ib4,
    Ib5,
    Ib6,
    Ib7,
}

pub const IB_TRANSPORTS: [Transport; NUM_IB_TRANSPORTS] = [
    Transport::Ib0,
    Transport::Ib1,
    Transport::Ib2,
    Transport::Ib3,
    Transport::Ib4,
    Transport::Ib5,
    Transport::Ib6,
    Transport::Ib7,
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct TransportFlags: u16 {
        const CUDA_IPC = 1 << 0;
        const IB0 = 1 << 1;
        const IB1 = 1 << 2;
        const IB2 = 1 << 3;
        const IB3 = 1 << 4;
        const IB4 = 1 << 5;
        const IB5 = 1 << 6;
        const IB6 = 1 << 7;
        const IB7 = 1 << 8;
        const ALL_IB = Self::IB0.bits() | Self::IB1.bits() | Self::IB2.bits() | Self::IB3.bits()
            | Self::IB4.bits() | Self::IB5.bits() | Self::IB6.bits() | Self::IB7.bits();
    }
}

impl Transport {
    #[inline]
    pub fn is_ib(self) -> bool {
        self != Transport::CudaIpc
    }

    pub fn ib_index(self) -> Option<usize> {
        match self {
            Transport::CudaIpc => None,
            ib => Some(ib as usize - 1),
        }
    }

    pub fn ib(index: usize) -> Option<Transport> {
        IB_TRANSPORTS.get(index).copied()
    }

    #[inline]
    pub fn flag(self) -> TransportFlags {
        TransportFlags::from_bits_retain(1 << (self as u16))
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ib_index() {
            None => f.write_str("CudaIpc"),
            Some(idx) => write!(f, "IB{}", idx),
        }
    }
}

impl From<Transport> for TransportFlags {
    fn from(transport: Transport) -> Self {
        transport.flag()
    }
}

impl TransportFlags {
    #[inline]
    pub fn has(self, transport: Transport) -> bool {
        self.contains(transport.flag())
    }

    /// Member transports in ascending order.
    pub fn transports(self) -> impl Iterator<Item = Transport> {
        std::iter::once(Transport::CudaIpc)
            .chain(IB_TRANSPORTS)
            .filter(move |t| self.has(*t))
    }
}

#[inline]
pub fn in_same_node(rank1: usize, rank2: usize, nranks_per_node: usize) -> bool {
    rank1 / nranks_per_node == rank2 / nranks_per_node
}

/// The fabric transport a rank uses to leave its node.
pub fn inter_node_transport(rank: usize, nranks_per_node: usize) -> Result<Transport, Error> {
    let index = rank % nranks_per_node;
    Transport::ib(index).ok_or_else(|| {
        Error::Internal(format!(
            "No fabric transport for local rank {} (at most {} devices per node)",
            index, NUM_IB_TRANSPORTS
        ))
    })
}
