//! Cross-rank counters bound to one connection.
//!
//! Both kinds register their inbound counter and exchange it with the peer
//! during setup, in both directions. A semaphore that is only ever signalled
//! one way still needs the peer to build its matching semaphore, otherwise
//! the receive never completes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::gpu::DeviceBuffer;
use crate::memory::RegisteredMemory;
use crate::setup::{SetupBatch, SetupFuture};
use crate::transport::{Connection, Transport};

const COUNTER_SIZE: usize = std::mem::size_of::<u64>();

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceSemaphoreHandle {
    pub inbound_semaphore_id: u64,
    pub expected_inbound_semaphore_id: u64,
    pub outbound_semaphore_id: u64,
    pub remote_inbound_semaphore_id: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct HostDeviceSemaphoreHandle {
    pub inbound_semaphore_id: u64,
    pub expected_inbound_semaphore_id: u64,
}

struct SemaphoreBase {
    connection: Arc<Connection>,
    inbound: DeviceBuffer,
    // registration of `inbound`, kept alive for the peer
    _local_inbound: RegisteredMemory,
    remote_inbound: SetupFuture<RegisteredMemory>,
}

impl SemaphoreBase {
    fn new(
        comm: &Communicator,
        batch: &mut SetupBatch,
        connection: Arc<Connection>,
        transport: Transport,
    ) -> Result<Self> {
        let inbound = DeviceBuffer::zeroed(comm.device(), COUNTER_SIZE)?;
        let local_inbound =
            comm.register_memory(inbound.addr().get(), COUNTER_SIZE, transport.into())?;
        let remote_rank = connection.remote_rank();
        let tag = connection.tag();
        comm.send_memory_on_setup(batch, &local_inbound, remote_rank, tag);
        let remote_inbound = comm.recv_memory_on_setup(batch, remote_rank, tag);
        Ok(SemaphoreBase {
            connection,
            inbound,
            _local_inbound: local_inbound,
            remote_inbound,
        })
    }
}

/// Semaphore whose peer writes directly into device memory over `CudaIpc`.
pub struct DeviceSemaphore {
    base: SemaphoreBase,
    // expected inbound and outbound counters
    locals: DeviceBuffer,
}

impl DeviceSemaphore {
    pub fn new(
        comm: &Communicator,
        batch: &mut SetupBatch,
        connection: Arc<Connection>,
    ) -> Result<Self> {
        if connection.transport() != Transport::CudaIpc {
            return Err(Error::InvalidUsage(format!(
                "Device semaphore needs a CudaIpc connection, got {}",
                connection.transport()
            )));
        }
        let base = SemaphoreBase::new(comm, batch, connection, Transport::CudaIpc)?;
        let locals = DeviceBuffer::zeroed(comm.device(), 2 * COUNTER_SIZE)?;
        Ok(DeviceSemaphore { base, locals })
    }

    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.base.connection
    }

    pub fn device_handle(&self) -> Result<DeviceSemaphoreHandle> {
        let remote = self.base.remote_inbound.get_ref()?;
        if remote.data() == 0 {
            return Err(Error::Internal(format!(
                "Inbound counter of rank {} is not mapped",
                remote.rank()
            )));
        }
        let locals = self.locals.addr().get() as u64;
        Ok(DeviceSemaphoreHandle {
            inbound_semaphore_id: self.base.inbound.addr().get() as u64,
            expected_inbound_semaphore_id: locals,
            outbound_semaphore_id: locals + COUNTER_SIZE as u64,
            remote_inbound_semaphore_id: remote.data() as u64,
        })
    }
}

/// Semaphore signalled by the host, on behalf of the device, through the
/// connection's transport.
pub struct HostDeviceSemaphore {
    base: SemaphoreBase,
    expected_inbound: DeviceBuffer,
    outbound: AtomicU64,
}

impl HostDeviceSemaphore {
    pub fn new(
        comm: &Communicator,
        batch: &mut SetupBatch,
        connection: Arc<Connection>,
    ) -> Result<Self> {
        let transport = connection.transport();
        let base = SemaphoreBase::new(comm, batch, connection, transport)?;
        let expected_inbound = DeviceBuffer::zeroed(comm.device(), COUNTER_SIZE)?;
        Ok(HostDeviceSemaphore {
            base,
            expected_inbound,
            outbound: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.base.connection
    }

    /// Bumps the peer's inbound counter.
    pub fn signal(&self) -> Result<()> {
        let remote = self.base.remote_inbound.get_ref()?;
        let value = self.outbound.fetch_add(1, Ordering::AcqRel) + 1;
        self.base.connection.update_and_sync(remote, 0, value)
    }

    /// Current value of the counter peers signal.
    pub fn inbound(&self) -> Result<u64> {
        let data = self.base.inbound.read()?;
        let mut bytes = [0u8; COUNTER_SIZE];
        bytes.copy_from_slice(&data[..COUNTER_SIZE]);
        Ok(u64::from_ne_bytes(bytes))
    }

    pub fn device_handle(&self) -> HostDeviceSemaphoreHandle {
        HostDeviceSemaphoreHandle {
            inbound_semaphore_id: self.base.inbound.addr().get() as u64,
            expected_inbound_semaphore_id: self.expected_inbound.addr().get() as u64,
        }
    }
}
