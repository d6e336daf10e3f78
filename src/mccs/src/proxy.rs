//! Host proxy that performs fabric operations on behalf of device kernels.
//!
//! Kernels (or host code through [`ProxyFifo`]) push [`ProxyTrigger`]s into a
//! ring in device memory; the proxy thread polls the ring and turns each
//! trigger into a write, a semaphore signal or a flush on the semaphore's
//! connection.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use crossbeam::utils::Backoff;
use once_cell::sync::OnceCell;
use spin::Mutex;

use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::gpu::ptr::DeviceNonNull;
use crate::gpu::{Device, DeviceBuffer, DeviceError};
use crate::memory::RegisteredMemory;
use crate::semaphore::{HostDeviceSemaphore, HostDeviceSemaphoreHandle};
use crate::setup::SetupBatch;
use crate::transport::Connection;

pub type SemaphoreId = u32;
pub type MemoryId = u32;

pub const FIFO_SIZE: usize = 128;
pub const MAX_PROXY_MEMORIES: usize = 1 << 9;
pub const MAX_PROXY_SEMAPHORES: usize = 1 << 10;

const TRIGGER_SIZE: usize = std::mem::size_of::<ProxyTrigger>();
const COUNTER_SIZE: usize = std::mem::size_of::<u64>();
const MAX_FIELD: u64 = u32::MAX as u64;
const TRIGGER_VALID: u64 = 1 << 63;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct TriggerType: u8 {
        const DATA = 0b001;
        const FLAG = 0b010;
        const SYNC = 0b100;
    }
}

/// A 128-bit request as it sits in the device ring.
///
/// `fst`: size (bits 0..32), source offset (32..64).
/// `snd`: destination offset (0..32), source memory (32..41), destination
/// memory (41..50), type (50..53), semaphore (53..63), valid (63).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ProxyTrigger {
    pub fst: u64,
    pub snd: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerType,
    pub semaphore: SemaphoreId,
    pub dst: MemoryId,
    pub dst_offset: u64,
    pub src: MemoryId,
    pub src_offset: u64,
    pub size: u64,
}

impl Trigger {
    pub fn put(semaphore: SemaphoreId, dst: MemoryId, dst_offset: u64, src: MemoryId, src_offset: u64, size: u64) -> Self {
        Trigger {
            kind: TriggerType::DATA,
            semaphore,
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        }
    }

    pub fn signal(semaphore: SemaphoreId) -> Self {
        Trigger {
            kind: TriggerType::FLAG,
            semaphore,
            dst: 0,
            dst_offset: 0,
            src: 0,
            src_offset: 0,
            size: 0,
        }
    }

    pub fn flush(semaphore: SemaphoreId) -> Self {
        Trigger {
            kind: TriggerType::SYNC,
            ..Self::signal(semaphore)
        }
    }

    pub fn with(mut self, kind: TriggerType) -> Self {
        self.kind |= kind;
        self
    }

    pub fn encode(&self) -> Result<ProxyTrigger> {
        if self.size > MAX_FIELD || self.src_offset > MAX_FIELD || self.dst_offset > MAX_FIELD {
            return Err(Error::InvalidUsage(format!(
                "Trigger offsets and size must fit in 32 bits: {:?}",
                self
            )));
        }
        if self.src as usize >= MAX_PROXY_MEMORIES
            || self.dst as usize >= MAX_PROXY_MEMORIES
            || self.semaphore as usize >= MAX_PROXY_SEMAPHORES
        {
            return Err(Error::InvalidUsage(format!(
                "Trigger ids out of range: {:?}",
                self
            )));
        }
        Ok(ProxyTrigger {
            fst: self.size | (self.src_offset << 32),
            snd: self.dst_offset
                | (self.src as u64) << 32
                | (self.dst as u64) << 41
                | (self.kind.bits() as u64) << 50
                | (self.semaphore as u64) << 53
                | TRIGGER_VALID,
        })
    }
}

impl ProxyTrigger {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.snd & TRIGGER_VALID != 0
    }

    pub fn decode(&self) -> Trigger {
        Trigger {
            kind: TriggerType::from_bits_truncate(((self.snd >> 50) & 0b111) as u8),
            semaphore: ((self.snd >> 53) & 0x3ff) as SemaphoreId,
            dst: ((self.snd >> 41) & 0x1ff) as MemoryId,
            dst_offset: self.snd & MAX_FIELD,
            src: ((self.snd >> 32) & 0x1ff) as MemoryId,
            src_offset: self.fst >> 32,
            size: self.fst & MAX_FIELD,
        }
    }

    fn to_bytes(self) -> [u8; TRIGGER_SIZE] {
        let mut bytes = [0u8; TRIGGER_SIZE];
        bytes[..8].copy_from_slice(&self.fst.to_ne_bytes());
        bytes[8..].copy_from_slice(&self.snd.to_ne_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; TRIGGER_SIZE]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let fst = u64::from_ne_bytes(word);
        word.copy_from_slice(&bytes[8..]);
        let snd = u64::from_ne_bytes(word);
        ProxyTrigger { fst, snd }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FifoDeviceHandle {
    pub triggers: u64,
    pub head: u64,
    pub tail_replica: u64,
    pub size: u32,
    pub _pad: u32,
}

struct FifoRing {
    // FIFO_SIZE triggers
    triggers: DeviceBuffer,
    // head counter, then the tail replica
    counters: DeviceBuffer,
}

impl FifoRing {
    fn new(device: &Arc<dyn Device>) -> Result<Self, DeviceError> {
        Ok(FifoRing {
            triggers: DeviceBuffer::zeroed(device, FIFO_SIZE * TRIGGER_SIZE)?,
            counters: DeviceBuffer::zeroed(device, 2 * COUNTER_SIZE)?,
        })
    }

    fn slot(&self, index: u64) -> DeviceNonNull<u8> {
        self.triggers
            .as_ptr()
            .byte_add((index as usize % FIFO_SIZE) * TRIGGER_SIZE)
    }

    fn head_ptr(&self) -> DeviceNonNull<u8> {
        self.counters.as_ptr()
    }

    fn tail_ptr(&self) -> DeviceNonNull<u8> {
        self.counters.as_ptr().byte_add(COUNTER_SIZE)
    }

    fn device_handle(&self) -> FifoDeviceHandle {
        FifoDeviceHandle {
            triggers: self.triggers.addr().get() as u64,
            head: self.head_ptr().addr().get() as u64,
            tail_replica: self.tail_ptr().addr().get() as u64,
            size: FIFO_SIZE as u32,
            _pad: 0,
        }
    }
}

fn read_counter(device: &dyn Device, ptr: DeviceNonNull<u8>) -> Result<u64, DeviceError> {
    let mut bytes = [0u8; COUNTER_SIZE];
    device.memcpy_dtoh(&mut bytes, ptr)?;
    Ok(u64::from_ne_bytes(bytes))
}

/// Host-side producer for the proxy FIFO.
#[derive(Clone)]
pub struct ProxyFifo {
    ring: Arc<FifoRing>,
    device: Arc<dyn Device>,
    push_lock: Arc<Mutex<()>>,
    failure: Arc<OnceCell<Error>>,
}

impl ProxyFifo {
    /// Enqueues a trigger, waiting while the ring is full.
    pub fn push(&self, trigger: Trigger) -> Result<()> {
        let raw = trigger.encode()?;
        let _guard = self.push_lock.lock();
        let device = self.device.as_ref();
        let head = read_counter(device, self.ring.head_ptr())?;
        let backoff = Backoff::new();
        while head - read_counter(device, self.ring.tail_ptr())? >= FIFO_SIZE as u64 {
            // a failed proxy never drains the ring
            if let Some(e) = self.failure.get() {
                return Err(Error::Executor(format!("Proxy failed: {}", e)));
            }
            backoff.snooze();
        }
        device.memcpy_htod(self.ring.slot(head), &raw.to_bytes())?;
        device.memcpy_htod(self.ring.head_ptr(), &(head + 1).to_ne_bytes())?;
        Ok(())
    }

    /// Number of triggers the proxy has consumed so far.
    pub fn tail(&self) -> Result<u64> {
        Ok(read_counter(self.device.as_ref(), self.ring.tail_ptr())?)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ProxyChannelDeviceHandle {
    pub semaphore_id: u32,
    pub _pad: u32,
    pub semaphore: HostDeviceSemaphoreHandle,
    pub fifo: FifoDeviceHandle,
}

/// Device-side view of one proxy semaphore plus the FIFO that reaches the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyChannel {
    semaphore_id: SemaphoreId,
    semaphore: HostDeviceSemaphoreHandle,
    fifo: FifoDeviceHandle,
}

impl ProxyChannel {
    #[inline]
    pub fn semaphore_id(&self) -> SemaphoreId {
        self.semaphore_id
    }

    pub fn device_handle(&self) -> ProxyChannelDeviceHandle {
        ProxyChannelDeviceHandle {
            semaphore_id: self.semaphore_id,
            _pad: 0,
            semaphore: self.semaphore,
            fifo: self.fifo,
        }
    }
}

struct ProxyState {
    semaphores: Vec<Arc<HostDeviceSemaphore>>,
    memories: Vec<RegisteredMemory>,
}

impl ProxyState {
    fn handle_trigger(&self, trigger: &Trigger) -> Result<()> {
        let semaphore = self
            .semaphores
            .get(trigger.semaphore as usize)
            .ok_or_else(|| Error::Internal(format!("Unknown semaphore {}", trigger.semaphore)))?;
        let connection: &Connection = semaphore.connection();
        if trigger.kind.contains(TriggerType::DATA) {
            let dst = self.memory(trigger.dst)?;
            let src = self.memory(trigger.src)?;
            connection.write(dst, trigger.dst_offset, src, trigger.src_offset, trigger.size)?;
        }
        if trigger.kind.contains(TriggerType::FLAG) {
            semaphore.signal()?;
        }
        if trigger.kind.contains(TriggerType::SYNC) {
            connection.flush()?;
        }
        Ok(())
    }

    fn memory(&self, id: MemoryId) -> Result<&RegisteredMemory> {
        self.memories
            .get(id as usize)
            .ok_or_else(|| Error::Internal(format!("Unknown proxy memory {}", id)))
    }
}

pub struct ProxyService {
    rank: usize,
    device: Arc<dyn Device>,
    ring: Arc<FifoRing>,
    push_lock: Arc<Mutex<()>>,
    state: ProxyState,
    // first error of the proxy thread, after which it exits
    failure: Arc<OnceCell<Error>>,
    worker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl ProxyService {
    pub fn new(comm: &Communicator) -> Result<Self> {
        let device = Arc::clone(comm.device());
        let ring = Arc::new(FifoRing::new(&device)?);
        Ok(ProxyService {
            rank: comm.rank(),
            device,
            ring,
            push_lock: Arc::new(Mutex::new(())),
            state: ProxyState {
                semaphores: Vec::new(),
                memories: Vec::new(),
            },
            failure: Arc::new(OnceCell::new()),
            worker: None,
        })
    }

    fn check_stopped(&self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::InvalidUsage(
                "Proxy service is already running".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds a host-signalled semaphore over `connection`; it is ready once `batch` is set up.
    pub fn build_and_add_semaphore(
        &mut self,
        comm: &Communicator,
        batch: &mut SetupBatch,
        connection: Arc<Connection>,
    ) -> Result<SemaphoreId> {
        self.check_stopped()?;
        if self.state.semaphores.len() >= MAX_PROXY_SEMAPHORES {
            return Err(Error::Internal("Too many proxy semaphores".to_string()));
        }
        let semaphore = HostDeviceSemaphore::new(comm, batch, connection)?;
        self.state.semaphores.push(Arc::new(semaphore));
        Ok((self.state.semaphores.len() - 1) as SemaphoreId)
    }

    pub fn add_memory(&mut self, memory: RegisteredMemory) -> Result<MemoryId> {
        self.check_stopped()?;
        if self.state.memories.len() >= MAX_PROXY_MEMORIES {
            return Err(Error::Internal("Too many proxy memories".to_string()));
        }
        self.state.memories.push(memory);
        Ok((self.state.memories.len() - 1) as MemoryId)
    }

    pub fn semaphore(&self, id: SemaphoreId) -> Result<&Arc<HostDeviceSemaphore>> {
        self.state
            .semaphores
            .get(id as usize)
            .ok_or_else(|| Error::InvalidUsage(format!("Unknown semaphore {}", id)))
    }

    pub fn proxy_channel(&self, id: SemaphoreId) -> Result<ProxyChannel> {
        let semaphore = self.semaphore(id)?;
        Ok(ProxyChannel {
            semaphore_id: id,
            semaphore: semaphore.device_handle(),
            fifo: self.ring.device_handle(),
        })
    }

    pub fn fifo(&self) -> ProxyFifo {
        ProxyFifo {
            ring: Arc::clone(&self.ring),
            device: Arc::clone(&self.device),
            push_lock: Arc::clone(&self.push_lock),
            failure: Arc::clone(&self.failure),
        }
    }

    pub fn num_semaphores(&self) -> usize {
        self.state.semaphores.len()
    }

    pub fn num_memories(&self) -> usize {
        self.state.memories.len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Reports the error the proxy thread stopped on, if any.
    pub fn check(&self) -> Result<()> {
        match self.failure.get() {
            Some(e) => Err(Error::Executor(format!(
                "Proxy of rank {} failed: {}",
                self.rank, e
            ))),
            None => Ok(()),
        }
    }

    pub fn start_proxy(&mut self) -> Result<()> {
        self.check_stopped()?;
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let state = ProxyState {
            semaphores: self.state.semaphores.clone(),
            memories: self.state.memories.clone(),
        };
        let ring = Arc::clone(&self.ring);
        let device = Arc::clone(&self.device);
        let failure = Arc::clone(&self.failure);
        let rank = self.rank;
        let handle = std::thread::Builder::new()
            .name(format!("proxy-rank:{}", rank))
            .spawn(move || {
                if let Err(e) = proxy_mainloop(state, ring, device, stop_rx) {
                    log::error!("Proxy of rank {} stopped: {}", rank, e);
                    let _ = failure.set(e);
                }
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn proxy thread: {}", e)))?;
        log::info!(
            "Proxy service of rank {} started with {} semaphores, {} memories",
            rank,
            self.state.semaphores.len(),
            self.state.memories.len()
        );
        self.worker = Some((stop_tx, handle));
        Ok(())
    }

    /// Stops the proxy thread, then reports any error it stopped on.
    pub fn stop_proxy(&mut self) -> Result<()> {
        if let Some((stop_tx, handle)) = self.worker.take() {
            if stop_tx.send(()).is_err() {
                log::debug!("Proxy thread of rank {} already exited", self.rank);
            }
            handle.join().map_err(|_| {
                Error::Internal(format!("Proxy thread of rank {} panicked", self.rank))
            })?;
            log::debug!("Proxy service of rank {} stopped", self.rank);
        }
        self.check()
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        if let Err(e) = self.stop_proxy() {
            log::warn!("Dropping proxy service: {}", e);
        }
    }
}

fn proxy_mainloop(
    state: ProxyState,
    ring: Arc<FifoRing>,
    device: Arc<dyn Device>,
    stop_rx: Receiver<()>,
) -> Result<()> {
    let device = device.as_ref();
    let mut tail = 0u64;
    let backoff = Backoff::new();
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
            Err(TryRecvError::Empty) => {}
        }
        let mut bytes = [0u8; TRIGGER_SIZE];
        device.memcpy_dtoh(&mut bytes, ring.slot(tail))?;
        let raw = ProxyTrigger::from_bytes(&bytes);
        if !raw.is_valid() {
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
            continue;
        }
        backoff.reset();
        let trigger = raw.decode();
        state.handle_trigger(&trigger).map_err(|e| {
            Error::Executor(format!("Trigger {:?} failed: {}", trigger, e))
        })?;
        device.memcpy_htod(ring.slot(tail), &[0u8; TRIGGER_SIZE])?;
        tail += 1;
        device.memcpy_htod(ring.tail_ptr(), &tail.to_ne_bytes())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceBuffer;
    use crate::test_utils::spawn_communicators;
    use crate::transport::{inter_node_transport, Transport};

    #[test]
    fn trigger_encoding() {
        let trigger = Trigger::put(7, 3, 4096, 1, 128, 1 << 20).with(TriggerType::FLAG);
        let raw = trigger.encode().unwrap();
        assert!(raw.is_valid());
        assert_eq!(raw.decode(), trigger);
        assert!(!ProxyTrigger::default().is_valid());
        assert!(Trigger::put(0, 0, 1 << 32, 0, 0, 8).encode().is_err());
        assert!(Trigger::signal(MAX_PROXY_SEMAPHORES as u32).encode().is_err());
    }

    #[test]
    fn proxy_put_and_signal_across_nodes() {
        const SIZE: usize = 1024;
        spawn_communicators(2, 1, |comm| {
            let rank = comm.rank();
            let peer = 1 - rank;
            let transport = inter_node_transport(rank, 1).unwrap();
            let mut batch = SetupBatch::new();
            let conn = comm.connect_on_setup(&mut batch, peer, 0, transport).unwrap();
            comm.setup(batch).unwrap();
            let conn = conn.get().unwrap();

            let src = DeviceBuffer::from_slice(comm.device(), &[rank as u8 + 10; SIZE]).unwrap();
            let dst = DeviceBuffer::zeroed(comm.device(), SIZE).unwrap();
            let src_mem = comm.register_memory(src.addr().get(), SIZE, transport.into()).unwrap();
            let dst_mem = comm.register_memory(dst.addr().get(), SIZE, transport.into()).unwrap();

            let mut proxy = ProxyService::new(comm).unwrap();
            let mut batch = SetupBatch::new();
            let semaphore = proxy
                .build_and_add_semaphore(comm, &mut batch, conn)
                .unwrap();
            comm.send_memory_on_setup(&mut batch, &dst_mem, peer, 1);
            let remote_dst = comm.recv_memory_on_setup(&mut batch, peer, 1);
            comm.setup(batch).unwrap();
            let remote_dst = proxy.add_memory(remote_dst.get().unwrap()).unwrap();
            let local_src = proxy.add_memory(src_mem).unwrap();
            let channel = proxy.proxy_channel(semaphore).unwrap();
            assert_eq!(channel.device_handle().fifo.size, FIFO_SIZE as u32);

            proxy.start_proxy().unwrap();
            assert!(proxy.add_memory(dst_mem.clone()).is_err());
            let fifo = proxy.fifo();
            fifo.push(Trigger::put(semaphore, remote_dst, 256, local_src, 0, 512).with(TriggerType::FLAG | TriggerType::SYNC))
                .unwrap();
            let backoff = Backoff::new();
            while proxy.semaphore(semaphore).unwrap().inbound().unwrap() < 1 {
                backoff.snooze();
            }
            let data = dst.read().unwrap();
            assert!(data[..256].iter().all(|b| *b == 0));
            assert!(data[256..768].iter().all(|b| *b == peer as u8 + 10));
            assert!(data[768..].iter().all(|b| *b == 0));
            comm.bootstrap().barrier().unwrap();
            proxy.stop_proxy().unwrap();
            assert!(!proxy.is_running());
            assert_eq!(fifo.tail().unwrap(), 1);
            assert_eq!(proxy.semaphore(semaphore).unwrap().connection().transport(), Transport::Ib0);
        });
    }
    #[test]
    fn failed_trigger_stops_the_proxy() {
        spawn_communicators(1, 1, |comm| {
            let mut proxy = ProxyService::new(comm).unwrap();
            proxy.start_proxy().unwrap();
            assert!(proxy.check().is_ok());
            // no semaphore 3 was ever added
            proxy.fifo().push(Trigger::signal(3)).unwrap();
            let backoff = Backoff::new();
            while proxy.check().is_ok() {
                backoff.snooze();
            }
            let err = proxy.check().unwrap_err();
            assert_eq!(err.code(), crate::ErrorCode::ExecutorError);
            assert!(err.to_string().contains("Unknown semaphore 3"));
            let err = proxy.stop_proxy().unwrap_err();
            assert_eq!(err.code(), crate::ErrorCode::ExecutorError);
            assert!(!proxy.is_running());
        });
    }
}
