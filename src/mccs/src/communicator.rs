use std::sync::{Arc, MutexGuard, PoisonError};

use dashmap::DashMap;
use spin::Mutex;

use crate::bootstrap::Bootstrap;
use crate::error::{Error, Result};
use crate::gpu::{Device, HostDevice};
use crate::memory::RegisteredMemory;
use crate::setup::{SetupBatch, SetupFuture, SetupPromise, Setuppable};
use crate::transport::connection::ConnectionSetup;
use crate::transport::fabric::{Fabric, FabricContext, SoftFabric};
use crate::transport::{Connection, IbConnection, IpcConnection, Transport, TransportFlags};
use crate::utils::hca::{default_hca_devices, parse_hca_list};
use crate::utils::{self, HCA_DEVICES_ENV};

/// One rank's view of the job: bootstrap, device, fabric contexts and the
/// connections established so far.
pub struct Communicator {
    bootstrap: Arc<dyn Bootstrap>,
    device: Arc<dyn Device>,
    fabric: Arc<dyn Fabric>,
    hca_devices: Vec<String>,
    rank_host_hashes: Vec<u64>,
    transport_contexts: DashMap<Transport, Arc<dyn FabricContext>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    // held across multi-batch exchanges such as an execution context build
    setup_lock: std::sync::Mutex<()>,
}

pub struct CommunicatorBuilder {
    bootstrap: Arc<dyn Bootstrap>,
    device: Option<Arc<dyn Device>>,
    fabric: Option<Arc<dyn Fabric>>,
    hca_devices: Option<Vec<String>>,
    host_hash: Option<u64>,
}

impl CommunicatorBuilder {
    pub fn device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// Fabric device names; the n-th backs transport `Ib<n>`.
    pub fn hca_devices(mut self, devices: Vec<String>) -> Self {
        self.hca_devices = Some(devices);
        self
    }

    /// Overrides the node fingerprint, e.g. to emulate several nodes in one process.
    pub fn host_hash(mut self, host_hash: u64) -> Self {
        self.host_hash = Some(host_hash);
        self
    }

    /// Gathers every rank's node fingerprint; all ranks must call this together.
    pub fn build(self) -> Result<Communicator> {
        let rank = self.bootstrap.rank();
        let num_ranks = self.bootstrap.num_ranks();
        let num_ranks_per_node = self.bootstrap.num_ranks_per_node();
        let device = match self.device {
            Some(device) => device,
            None => HostDevice::shared((rank % num_ranks_per_node) as i32),
        };
        let hca_devices = match self.hca_devices {
            Some(devices) => devices,
            None => match std::env::var(HCA_DEVICES_ENV) {
                Ok(list) => parse_hca_list(&list)
                    .map_err(|e| Error::InvalidUsage(e.to_string()))?
                    .into_iter()
                    .map(|spec| spec.name)
                    .collect(),
                Err(_) => default_hca_devices(),
            },
        };
        let fabric = match self.fabric {
            Some(fabric) => fabric,
            None => Arc::new(SoftFabric::new(Arc::clone(&device), hca_devices.clone())),
        };
        let host_hash = self.host_hash.unwrap_or_else(utils::host_hash);

        const HASH_SIZE: usize = std::mem::size_of::<u64>();
        let mut gathered = vec![0u8; HASH_SIZE * num_ranks];
        gathered[rank * HASH_SIZE..(rank + 1) * HASH_SIZE].copy_from_slice(&host_hash.to_le_bytes());
        self.bootstrap.all_gather(&mut gathered, HASH_SIZE)?;
        let rank_host_hashes = gathered
            .chunks_exact(HASH_SIZE)
            .map(|chunk| {
                let mut bytes = [0u8; HASH_SIZE];
                bytes.copy_from_slice(chunk);
                u64::from_le_bytes(bytes)
            })
            .collect();

        log::info!(
            "Communicator rank {} of {} ({} per node) on device {}, host hash {:#x}",
            rank,
            num_ranks,
            num_ranks_per_node,
            device.device_index(),
            host_hash
        );
        Ok(Communicator {
            bootstrap: self.bootstrap,
            device,
            fabric,
            hca_devices,
            rank_host_hashes,
            transport_contexts: DashMap::new(),
            connections: Mutex::new(Vec::new()),
            setup_lock: std::sync::Mutex::new(()),
        })
    }
}

impl Communicator {
    pub fn builder(bootstrap: Arc<dyn Bootstrap>) -> CommunicatorBuilder {
        CommunicatorBuilder {
            bootstrap,
            device: None,
            fabric: None,
            hca_devices: None,
            host_hash: None,
        }
    }

    #[inline]
    pub fn bootstrap(&self) -> &Arc<dyn Bootstrap> {
        &self.bootstrap
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.bootstrap.rank()
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        self.bootstrap.num_ranks()
    }

    #[inline]
    pub fn num_ranks_per_node(&self) -> usize {
        self.bootstrap.num_ranks_per_node()
    }

    #[inline]
    pub fn host_hash(&self) -> u64 {
        self.rank_host_hashes[self.rank()]
    }

    pub fn rank_host_hash(&self, rank: usize) -> Result<u64> {
        self.rank_host_hashes
            .get(rank)
            .copied()
            .ok_or_else(|| Error::InvalidUsage(format!("Rank {} out of range", rank)))
    }

    /// Serializes exchanges that span several setup batches on this
    /// communicator. Messages are matched by peer and tag only, so every rank
    /// must run such exchanges in the same order.
    pub fn lock_setup(&self) -> MutexGuard<'_, ()> {
        self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fabric context of an IB transport, opened on first use.
    pub fn transport_context(&self, transport: Transport) -> Result<Arc<dyn FabricContext>> {
        let index = transport.ib_index().ok_or_else(|| {
            Error::Internal(format!("{} has no fabric context", transport))
        })?;
        let entry = self
            .transport_contexts
            .entry(transport)
            .or_try_insert_with(|| -> Result<Arc<dyn FabricContext>> {
                let name = self.hca_devices.get(index).ok_or_else(|| {
                    Error::Internal(format!("No fabric device configured for {}", transport))
                })?;
                log::info!(
                    "Rank {} opened fabric device {} for {}",
                    self.rank(),
                    name,
                    transport
                );
                Ok(self.fabric.open(name)?)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn register_memory(
        &self,
        ptr: usize,
        size: usize,
        transports: TransportFlags,
    ) -> Result<RegisteredMemory> {
        RegisteredMemory::register(self, ptr, size, transports)
    }

    pub fn send_memory_on_setup(
        &self,
        batch: &mut SetupBatch,
        memory: &RegisteredMemory,
        remote_rank: usize,
        tag: u32,
    ) {
        batch.push(MemorySender {
            memory: memory.clone(),
            remote_rank,
            tag,
        });
    }

    pub fn recv_memory_on_setup(
        &self,
        batch: &mut SetupBatch,
        remote_rank: usize,
        tag: u32,
    ) -> SetupFuture<RegisteredMemory> {
        let (future, promise) = SetupFuture::pending();
        batch.push(MemoryReceiver {
            remote_rank,
            tag,
            device: Arc::clone(&self.device),
            host_hash: self.host_hash(),
            promise: Some(promise),
        });
        future
    }

    /// Creates a connection to `remote_rank`; it is usable once `batch` is set up.
    pub fn connect_on_setup(
        &self,
        batch: &mut SetupBatch,
        remote_rank: usize,
        tag: u32,
        transport: Transport,
    ) -> Result<SetupFuture<Arc<Connection>>> {
        let remote_host_hash = self.rank_host_hash(remote_rank)?;
        let connection = match transport {
            Transport::CudaIpc => {
                if remote_host_hash != self.host_hash() {
                    return Err(Error::InvalidUsage(format!(
                        "CudaIpc connection from rank {} to rank {} crosses nodes",
                        self.rank(),
                        remote_rank
                    )));
                }
                log::info!(
                    "Rank {} connecting to rank {} over CudaIpc",
                    self.rank(),
                    remote_rank
                );
                Connection::CudaIpc(IpcConnection::new(
                    remote_rank,
                    tag,
                    Arc::clone(&self.device),
                )?)
            }
            ib => {
                let context = self.transport_context(ib)?;
                log::info!(
                    "Rank {} connecting to rank {} over {} ({})",
                    self.rank(),
                    remote_rank,
                    ib,
                    context.device_name()
                );
                Connection::Ib(IbConnection::new(remote_rank, tag, ib, context)?)
            }
        };
        let connection = Arc::new(connection);
        self.connections.lock().push(Arc::clone(&connection));
        let (future, promise) = SetupFuture::pending();
        batch.push(ConnectionSetup::new(connection, promise));
        Ok(future)
    }

    pub fn on_setup(&self, batch: &mut SetupBatch, action: impl Setuppable + 'static) {
        batch.push(action);
    }

    /// Runs every first phase of `batch`, then every second phase.
    pub fn setup(&self, batch: SetupBatch) -> Result<()> {
        batch.run(self.bootstrap.as_ref())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().len()
    }
}

struct MemorySender {
    memory: RegisteredMemory,
    remote_rank: usize,
    tag: u32,
}

impl Setuppable for MemorySender {
    fn begin_setup(&mut self, bootstrap: &dyn Bootstrap) -> Result<()> {
        bootstrap.send(&self.memory.serialize()?, self.remote_rank, self.tag)?;
        Ok(())
    }
}

struct MemoryReceiver {
    remote_rank: usize,
    tag: u32,
    device: Arc<dyn Device>,
    host_hash: u64,
    promise: Option<SetupPromise<RegisteredMemory>>,
}

impl Setuppable for MemoryReceiver {
    fn end_setup(&mut self, bootstrap: &dyn Bootstrap) -> Result<()> {
        let data = bootstrap.recv(self.remote_rank, self.tag)?;
        let memory = RegisteredMemory::deserialize(&data, &self.device, self.host_hash)?;
        match self.promise.take() {
            Some(promise) => promise.fulfill(memory),
            None => Err(Error::Internal("memory received twice".to_string())),
        }
    }
}
