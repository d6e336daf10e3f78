use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::bootstrap::Bootstrap;
use crate::error::{Error, Result};
use crate::gpu::ptr::DeviceNonNull;
use crate::gpu::{Device, Stream};
use crate::memory::{RegisteredMemory, TransportInfo};
use crate::setup::{SetupPromise, Setuppable};
use crate::transport::fabric::{FabricContext, QpInfo, QueuePair};
use crate::transport::Transport;

/// A live link to one peer, identified by (remote rank, tag).
pub enum Connection {
    CudaIpc(IpcConnection),
    Ib(IbConnection),
}

impl Connection {
    pub fn remote_rank(&self) -> usize {
        match self {
            Connection::CudaIpc(conn) => conn.remote_rank,
            Connection::Ib(conn) => conn.remote_rank,
        }
    }

    pub fn tag(&self) -> u32 {
        match self {
            Connection::CudaIpc(conn) => conn.tag,
            Connection::Ib(conn) => conn.tag,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Connection::CudaIpc(_) => Transport::CudaIpc,
            Connection::Ib(conn) => conn.transport,
        }
    }

    /// Transport the peer uses on its end; known once the handshake finished.
    pub fn remote_transport(&self) -> Result<Transport> {
        match self {
            Connection::CudaIpc(_) => Ok(Transport::CudaIpc),
            Connection::Ib(conn) => conn.remote_transport(),
        }
    }

    /// Copies `size` bytes of `src` into the peer's `dst`.
    pub fn write(
        &self,
        dst: &RegisteredMemory,
        dst_offset: u64,
        src: &RegisteredMemory,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        check_range(dst, dst_offset, size)?;
        check_range(src, src_offset, size)?;
        match self {
            Connection::CudaIpc(conn) => conn.write(dst, dst_offset, src, src_offset, size),
            Connection::Ib(conn) => conn.write(dst, dst_offset, src, src_offset, size),
        }
    }

    /// Stores `value` into the 64-bit word at `dst_offset` of the peer's `dst`.
    pub fn update_and_sync(&self, dst: &RegisteredMemory, dst_offset: u64, value: u64) -> Result<()> {
        check_range(dst, dst_offset, std::mem::size_of::<u64>() as u64)?;
        match self {
            Connection::CudaIpc(conn) => conn.update_and_sync(dst, dst_offset, value),
            Connection::Ib(conn) => conn.update_and_sync(dst, dst_offset, value),
        }
    }

    /// Waits for all previously issued operations to complete.
    pub fn flush(&self) -> Result<()> {
        match self {
            Connection::CudaIpc(conn) => Ok(conn.device.stream_synchronize(conn.stream)?),
            Connection::Ib(conn) => Ok(conn.qp.flush()?),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport())
            .field("remote_rank", &self.remote_rank())
            .field("tag", &self.tag())
            .finish()
    }
}

fn check_range(memory: &RegisteredMemory, offset: u64, size: u64) -> Result<()> {
    if offset.checked_add(size).map_or(true, |end| end > memory.size()) {
        return Err(Error::InvalidUsage(format!(
            "Access of {} bytes at offset {} exceeds memory of {} bytes",
            size,
            offset,
            memory.size()
        )));
    }
    Ok(())
}

fn mapped_ptr(memory: &RegisteredMemory, offset: u64) -> Result<DeviceNonNull<u8>> {
    DeviceNonNull::<u8>::from_addr(memory.data())
        .map(|ptr| ptr.byte_add(offset as usize))
        .ok_or_else(|| {
            Error::InvalidUsage(format!(
                "Memory of rank {} is not mapped in this process",
                memory.rank()
            ))
        })
}

/// Peer memory mapping between ranks of one node; data moves with
/// stream-ordered device copies.
pub struct IpcConnection {
    remote_rank: usize,
    tag: u32,
    device: Arc<dyn Device>,
    stream: Stream,
}

impl IpcConnection {
    pub(crate) fn new(remote_rank: usize, tag: u32, device: Arc<dyn Device>) -> Result<Self> {
        let stream = device.create_stream()?;
        Ok(IpcConnection {
            remote_rank,
            tag,
            device,
            stream,
        })
    }

    fn write(
        &self,
        dst: &RegisteredMemory,
        dst_offset: u64,
        src: &RegisteredMemory,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let dst_ptr = mapped_ptr(dst, dst_offset)?;
        let src_ptr = mapped_ptr(src, src_offset)?;
        self.device
            .memcpy_dtod_async(dst_ptr, src_ptr, size as usize, self.stream)?;
        Ok(())
    }

    fn update_and_sync(&self, dst: &RegisteredMemory, dst_offset: u64, value: u64) -> Result<()> {
        let dst_ptr = mapped_ptr(dst, dst_offset)?;
        self.device.memcpy_htod(dst_ptr, &value.to_ne_bytes())?;
        Ok(())
    }
}

impl Drop for IpcConnection {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_stream(self.stream) {
            log::warn!("Failed to destroy IPC connection stream: {}", e);
        }
    }
}

/// Queue-pair link to a rank on another node.
pub struct IbConnection {
    remote_rank: usize,
    tag: u32,
    transport: Transport,
    remote_transport: OnceCell<Transport>,
    qp: Box<dyn QueuePair>,
    // keeps the device context open while the queue pair lives
    _context: Arc<dyn FabricContext>,
}

impl IbConnection {
    pub(crate) fn new(
        remote_rank: usize,
        tag: u32,
        transport: Transport,
        context: Arc<dyn FabricContext>,
    ) -> Result<Self> {
        let qp = context.create_qp()?;
        Ok(IbConnection {
            remote_rank,
            tag,
            transport,
            remote_transport: OnceCell::new(),
            qp,
            _context: context,
        })
    }

    fn remote_transport(&self) -> Result<Transport> {
        self.remote_transport.get().copied().ok_or_else(|| {
            Error::InvalidUsage(format!(
                "Connection to rank {} used before setup",
                self.remote_rank
            ))
        })
    }

    fn remote_mr(&self, dst: &RegisteredMemory) -> Result<crate::transport::fabric::MrInfo> {
        match dst.transport_info(self.remote_transport()?)? {
            TransportInfo::Ib { mr, .. } => Ok(mr),
            TransportInfo::CudaIpc { .. } => Err(Error::Internal(
                "fabric connection resolved peer memory info".to_string(),
            )),
        }
    }

    fn write(
        &self,
        dst: &RegisteredMemory,
        dst_offset: u64,
        src: &RegisteredMemory,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let dst_mr = self.remote_mr(dst)?;
        let src_mr = src.memory_region(self.transport)?;
        self.qp
            .post_write(&src_mr, src_offset, &dst_mr, dst_offset, size)?;
        Ok(())
    }

    fn update_and_sync(&self, dst: &RegisteredMemory, dst_offset: u64, value: u64) -> Result<()> {
        let dst_mr = self.remote_mr(dst)?;
        self.qp.post_atomic_store(&dst_mr, dst_offset, value)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct IbHandshake {
    qp: QpInfo,
    transport: Transport,
}

/// Deferred handshake that finalizes a connection during batch setup.
pub(crate) struct ConnectionSetup {
    connection: Arc<Connection>,
    promise: Option<SetupPromise<Arc<Connection>>>,
}

impl ConnectionSetup {
    pub(crate) fn new(
        connection: Arc<Connection>,
        promise: SetupPromise<Arc<Connection>>,
    ) -> Self {
        ConnectionSetup {
            connection,
            promise: Some(promise),
        }
    }
}

impl Setuppable for ConnectionSetup {
    fn begin_setup(&mut self, bootstrap: &dyn Bootstrap) -> Result<()> {
        if let Connection::Ib(conn) = &*self.connection {
            let handshake = IbHandshake {
                qp: conn.qp.info(),
                transport: conn.transport,
            };
            bootstrap.send(&bincode::serialize(&handshake)?, conn.remote_rank, conn.tag)?;
        }
        Ok(())
    }

    fn end_setup(&mut self, bootstrap: &dyn Bootstrap) -> Result<()> {
        if let Connection::Ib(conn) = &*self.connection {
            let data = bootstrap.recv(conn.remote_rank, conn.tag)?;
            let handshake: IbHandshake = bincode::deserialize(&data)?;
            conn.qp.connect(&handshake.qp)?;
            conn.remote_transport
                .set(handshake.transport)
                .map_err(|_| Error::Internal("connection set up twice".to_string()))?;
            log::debug!(
                "IB connection to rank {} ready: local {} remote {}",
                conn.remote_rank,
                conn.transport,
                handshake.transport
            );
        }
        match self.promise.take() {
            Some(promise) => promise.fulfill(Arc::clone(&self.connection)),
            None => Err(Error::Internal("connection set up twice".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceBuffer;
    use crate::setup::SetupBatch;
    use crate::test_utils::spawn_communicators;
    use crate::transport::TransportFlags;

    #[test]
    fn writes_past_the_memory_are_rejected() {
        spawn_communicators(2, 2, |comm| {
            let mut batch = SetupBatch::new();
            let conn = comm
                .connect_on_setup(&mut batch, 1 - comm.rank(), 0, Transport::CudaIpc)
                .unwrap();
            comm.setup(batch).unwrap();
            let conn = conn.get().unwrap();
            let buffer = DeviceBuffer::zeroed(comm.device(), 64).unwrap();
            let memory = comm
                .register_memory(buffer.addr().get(), 64, TransportFlags::CUDA_IPC)
                .unwrap();
            conn.write(&memory, 0, &memory, 32, 32).unwrap();
            for (dst_offset, size) in [(40, 32), (u64::MAX - 8, 16), (8, u64::MAX)] {
                let err = conn.write(&memory, dst_offset, &memory, 0, size).unwrap_err();
                assert_eq!(err.code(), crate::ErrorCode::InvalidUsage);
            }
            let err = conn.update_and_sync(&memory, u64::MAX - 4, 1).unwrap_err();
            assert_eq!(err.code(), crate::ErrorCode::InvalidUsage);
            comm.bootstrap().barrier().unwrap();
        });
    }
}
