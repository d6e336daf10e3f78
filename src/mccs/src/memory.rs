use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::gpu::{Device, IpcMemHandle};
use crate::transport::fabric::{FabricContext, MemoryRegion, MrInfo};
use crate::transport::{Transport, TransportFlags};

/// How a peer reaches a registered buffer over one transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportInfo {
    CudaIpc {
        handle: IpcMemHandle,
        // offset of the buffer inside the allocation the handle maps
        offset: u64,
    },
    Ib {
        transport: Transport,
        mr: MrInfo,
        // only meaningful to the registering process
        #[serde(skip)]
        lkey: u32,
    },
}

impl TransportInfo {
    pub fn transport(&self) -> Transport {
        match self {
            TransportInfo::CudaIpc { .. } => Transport::CudaIpc,
            TransportInfo::Ib { transport, .. } => *transport,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MemoryDescriptor {
    rank: usize,
    size: u64,
    transports: TransportFlags,
    host_hash: u64,
    infos: Vec<TransportInfo>,
}

enum Origin {
    Local {
        regions: Vec<(Arc<dyn FabricContext>, MemoryRegion)>,
    },
    Remote {
        device: Arc<dyn Device>,
        ipc_base: Option<usize>,
    },
}

struct MemoryInner {
    rank: usize,
    data: usize,
    size: u64,
    transports: TransportFlags,
    host_hash: u64,
    infos: Vec<TransportInfo>,
    origin: Origin,
}

/// A buffer made reachable to peers over a set of transports.
///
/// The data pointer is only valid in the process holding the handle: it is
/// the registered buffer for the owner, the mapped peer memory for a
/// same-node receiver reached over `CudaIpc`, and null otherwise.
#[derive(Clone)]
pub struct RegisteredMemory {
    inner: Arc<MemoryInner>,
}

impl RegisteredMemory {
    pub(crate) fn register(
        comm: &Communicator,
        data: usize,
        size: usize,
        transports: TransportFlags,
    ) -> Result<Self> {
        let mut infos = Vec::new();
        let mut regions = Vec::new();
        for transport in transports.transports() {
            match transport {
                Transport::CudaIpc => {
                    let (base, _) = comm.device().address_range(data)?;
                    let handle = comm.device().ipc_handle(base)?;
                    infos.push(TransportInfo::CudaIpc {
                        handle,
                        offset: (data - base) as u64,
                    });
                }
                ib => {
                    let context = comm.transport_context(ib)?;
                    let mr = context.register_mr(data, size)?;
                    infos.push(TransportInfo::Ib {
                        transport: ib,
                        mr: mr.info,
                        lkey: mr.lkey,
                    });
                    regions.push((context, mr));
                }
            }
        }
        Ok(RegisteredMemory {
            inner: Arc::new(MemoryInner {
                rank: comm.rank(),
                data,
                size: size as u64,
                transports,
                host_hash: comm.host_hash(),
                infos,
                origin: Origin::Local { regions },
            }),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let descriptor = MemoryDescriptor {
            rank: self.inner.rank,
            size: self.inner.size,
            transports: self.inner.transports,
            host_hash: self.inner.host_hash,
            infos: self.inner.infos.clone(),
        };
        Ok(bincode::serialize(&descriptor)?)
    }

    /// Rebuilds a peer's descriptor in this process, mapping it over
    /// `CudaIpc` when the owner shares this node.
    pub fn deserialize(data: &[u8], device: &Arc<dyn Device>, host_hash: u64) -> Result<Self> {
        let descriptor: MemoryDescriptor = bincode::deserialize(data)?;
        let mut local_data = 0;
        let mut ipc_base = None;
        if descriptor.host_hash == host_hash && descriptor.transports.has(Transport::CudaIpc) {
            let (handle, offset) = descriptor
                .infos
                .iter()
                .find_map(|info| match info {
                    TransportInfo::CudaIpc { handle, offset } => Some((*handle, *offset)),
                    _ => None,
                })
                .ok_or_else(|| {
                    Error::Internal("CudaIpc flag without transport info".to_string())
                })?;
            let base = device.open_ipc_handle(&handle)?;
            ipc_base = Some(base);
            local_data = base + offset as usize;
        }
        Ok(RegisteredMemory {
            inner: Arc::new(MemoryInner {
                rank: descriptor.rank,
                data: local_data,
                size: descriptor.size,
                transports: descriptor.transports,
                host_hash: descriptor.host_hash,
                infos: descriptor.infos,
                origin: Origin::Remote {
                    device: Arc::clone(device),
                    ipc_base,
                },
            }),
        })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    /// Local address of the buffer, zero when it is not mapped here.
    #[inline]
    pub fn data(&self) -> usize {
        self.inner.data
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    #[inline]
    pub fn transports(&self) -> TransportFlags {
        self.inner.transports
    }

    #[inline]
    pub fn host_hash(&self) -> u64 {
        self.inner.host_hash
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self.inner.origin, Origin::Local { .. })
    }

    pub fn transport_info(&self, transport: Transport) -> Result<TransportInfo> {
        self.inner
            .infos
            .iter()
            .find(|info| info.transport() == transport)
            .copied()
            .ok_or_else(|| {
                Error::InvalidUsage(format!(
                    "Memory of rank {} is not registered over {}",
                    self.inner.rank, transport
                ))
            })
    }

    /// Local fabric region backing this buffer on `transport`.
    pub(crate) fn memory_region(&self, transport: Transport) -> Result<MemoryRegion> {
        match self.transport_info(transport)? {
            TransportInfo::Ib { mr, lkey, .. } if self.is_local() => Ok(MemoryRegion {
                info: mr,
                lkey,
                size: self.inner.size,
            }),
            _ => Err(Error::InvalidUsage(format!(
                "Memory of rank {} has no local region on {}",
                self.inner.rank, transport
            ))),
        }
    }
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        match &self.origin {
            Origin::Local { regions } => {
                for (context, mr) in regions {
                    if let Err(e) = context.deregister_mr(mr) {
                        log::warn!(
                            "Failed to deregister memory region on {}: {}",
                            context.device_name(),
                            e
                        );
                    }
                }
            }
            Origin::Remote {
                device,
                ipc_base: Some(base),
            } => {
                if let Err(e) = device.close_ipc_handle(*base) {
                    log::warn!("Failed to close IPC mapping {:#x}: {}", base, e);
                }
            }
            Origin::Remote { ipc_base: None, .. } => {}
        }
    }
}

impl fmt::Debug for RegisteredMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMemory")
            .field("rank", &self.inner.rank)
            .field("data", &format_args!("{:#x}", self.inner.data))
            .field("size", &self.inner.size)
            .field("transports", &self.inner.transports)
            .finish()
    }
}
