//! Builds, caches and launches execution contexts.
//!
//! An execution context holds every resource one (buffers, plan) pairing
//! needs on this rank: connections, exchanged memories, semaphores, channels
//! and the device instruction buffer. Contexts are keyed by the base address
//! and allocation size of both buffers plus the plan name, so calls that only
//! differ in message size or interior offset reuse a context after a light
//! reload of the plan.

pub mod device_plan;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{SimpleProxyChannel, SmChannel};
use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::gpu::{DeviceBuffer, Stream};
use crate::kernel::{shared_memory_size, DataType, KernelLaunch, PacketType};
use crate::memory::RegisteredMemory;
use crate::plan::{BufferType, ChannelInfo, ChannelType, ExecutionPlan, MessageSizes};
use crate::proxy::{ProxyService, SemaphoreId};
use crate::semaphore::DeviceSemaphore;
use crate::setup::{SetupBatch, SetupFuture};
use crate::transport::{in_same_node, inter_node_transport, Connection, Transport, TransportFlags};

#[cfg(feature = "npkit")]
use crate::kernel::NPKIT_MAX_NUM_GPU_THREADBLOCKS;

pub use device_plan::{DeviceExecutionPlan, MAX_CHANNEL_PER_THREADBLOCK, MAX_OPERATION};

const CONNECTION_TAG: u32 = 0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// a build in flight holds a clone of its key's lock
fn is_held(build_lock: &Arc<Mutex<()>>) -> bool {
    Arc::strong_count(build_lock) > 1
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecutionContextKey {
    pub send_buff: usize,
    pub recv_buff: usize,
    pub send_buff_size: usize,
    pub recv_buff_size: usize,
    pub plan: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub full_builds: usize,
    pub light_reloads: usize,
    pub launches: usize,
}

#[derive(Default)]
struct StatCounters {
    full_builds: AtomicUsize,
    light_reloads: AtomicUsize,
    launches: AtomicUsize,
}

// base address and allocation size of the caller's buffers
#[derive(Clone, Copy, Debug)]
struct UserBuffers {
    send: (usize, usize),
    recv: (usize, usize),
}

pub struct ExecutionContext {
    // dropped first so the proxy thread stops before anything it references
    proxy_service: ProxyService,
    connections: HashMap<usize, Arc<Connection>>,
    registered_memories: HashMap<(BufferType, usize), RegisteredMemory>,
    local_memories: Vec<RegisteredMemory>,
    sm_semaphores: Vec<Arc<DeviceSemaphore>>,
    proxy_semaphores: Vec<SemaphoreId>,
    sm_channels: Vec<SmChannel>,
    proxy_channels: Vec<SimpleProxyChannel>,
    device_execution_plans: Vec<DeviceExecutionPlan>,
    device_execution_plans_buffer: Option<DeviceBuffer>,
    scratch_buffer: Option<DeviceBuffer>,
    scratch_buffer_size: usize,
    num_threads_per_block: u32,
}

impl ExecutionContext {
    pub fn connections(&self) -> &HashMap<usize, Arc<Connection>> {
        &self.connections
    }

    pub fn registered_memory(&self, role: BufferType, peer: usize) -> Option<&RegisteredMemory> {
        self.registered_memories.get(&(role, peer))
    }

    pub fn num_registered_memories(&self) -> usize {
        self.registered_memories.len()
    }

    pub fn num_semaphores(&self) -> usize {
        self.sm_semaphores.len() + self.proxy_semaphores.len()
    }

    pub fn sm_channels(&self) -> &[SmChannel] {
        &self.sm_channels
    }

    pub fn proxy_channels(&self) -> &[SimpleProxyChannel] {
        &self.proxy_channels
    }

    pub fn proxy_service(&self) -> &ProxyService {
        &self.proxy_service
    }

    pub fn device_execution_plans(&self) -> &[DeviceExecutionPlan] {
        &self.device_execution_plans
    }

    /// Device address of the uploaded instruction records.
    pub fn device_execution_plans_addr(&self) -> usize {
        self.device_execution_plans_buffer
            .as_ref()
            .map_or(0, |buffer| buffer.addr().get())
    }

    pub fn scratch_buffer_addr(&self) -> usize {
        self.scratch_buffer
            .as_ref()
            .map_or(0, |buffer| buffer.addr().get())
    }

    #[inline]
    pub fn scratch_buffer_size(&self) -> usize {
        self.scratch_buffer_size
    }

    #[inline]
    pub fn num_threads_per_block(&self) -> u32 {
        self.num_threads_per_block
    }

    fn buffer(&self, buffers: &UserBuffers, role: BufferType) -> Result<(usize, usize)> {
        match role {
            BufferType::Input => Ok(buffers.send),
            BufferType::Output => Ok(buffers.recv),
            BufferType::Scratch => Ok((self.scratch_buffer_addr(), self.scratch_buffer_size)),
            BufferType::None => Err(Error::Executor("Invalid buffer type".to_string())),
        }
    }
}

pub struct Executor {
    comm: Arc<Communicator>,
    contexts: Mutex<HashMap<ExecutionContextKey, Arc<Mutex<ExecutionContext>>>>,
    build_locks: Mutex<HashMap<ExecutionContextKey, Arc<Mutex<()>>>>,
    max_cached_contexts: Option<usize>,
    flag: AtomicU32,
    stats: StatCounters,
}

impl Executor {
    pub fn new(comm: Arc<Communicator>) -> Self {
        Executor {
            comm,
            contexts: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
            max_cached_contexts: None,
            flag: AtomicU32::new(1),
            stats: StatCounters::default(),
        }
    }

    /// Bounds the cache; inserting beyond `limit` contexts clears it first.
    pub fn with_max_cached_contexts(mut self, limit: Option<usize>) -> Self {
        self.max_cached_contexts = limit;
        self
    }

    #[inline]
    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.comm
    }

    #[inline]
    pub fn max_cached_contexts(&self) -> Option<usize> {
        self.max_cached_contexts
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            full_builds: self.stats.full_builds.load(Ordering::Relaxed),
            light_reloads: self.stats.light_reloads.load(Ordering::Relaxed),
            launches: self.stats.launches.load(Ordering::Relaxed),
        }
    }

    pub fn cached_contexts(&self) -> usize {
        lock(&self.contexts).len()
    }

    pub fn cached_keys(&self) -> Vec<ExecutionContextKey> {
        lock(&self.contexts).keys().cloned().collect()
    }

    pub fn cached_context(&self, key: &ExecutionContextKey) -> Option<Arc<Mutex<ExecutionContext>>> {
        lock(&self.contexts).get(key).cloned()
    }

    /// Drops every context built for `plan`, returning how many were removed.
    pub fn invalidate(&self, plan: &str) -> usize {
        let removed: Vec<_> = {
            let mut contexts = lock(&self.contexts);
            let keys: Vec<_> = contexts.keys().filter(|key| key.plan == plan).cloned().collect();
            keys.into_iter()
                .filter_map(|key| contexts.remove(&key))
                .collect()
        };
        lock(&self.build_locks).retain(|key, build_lock| key.plan != plan || is_held(build_lock));
        log::debug!("Invalidated {} execution contexts of plan {}", removed.len(), plan);
        removed.len()
    }

    pub fn clear_cache(&self) {
        let removed = std::mem::take(&mut *lock(&self.contexts));
        lock(&self.build_locks).retain(|_, build_lock| is_held(build_lock));
        log::debug!("Cleared {} execution contexts", removed.len());
    }

    /// Runs `plan` on `rank` over the given device buffers.
    ///
    /// Buffers may point inside larger allocations; the enclosing allocation
    /// identifies the cached context and the interior offsets are folded
    /// into the plan's operation offsets.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        rank: usize,
        send_buff: usize,
        recv_buff: usize,
        send_buff_size: usize,
        recv_buff_size: usize,
        data_type: DataType,
        plan: &ExecutionPlan,
        stream: Stream,
        packet_type: PacketType,
    ) -> Result<()> {
        let device = self.comm.device();
        let (send_base, send_bytes) = device.address_range(send_buff)?;
        let (recv_base, recv_bytes) = device.address_range(recv_buff)?;
        let sizes = MessageSizes {
            input_size: send_buff_size as u64,
            output_size: recv_buff_size as u64,
            src_offset: (send_buff - send_base) as u64,
            dst_offset: (recv_buff - recv_base) as u64,
        };
        let buffers = UserBuffers {
            send: (send_base, send_bytes),
            recv: (recv_base, recv_bytes),
        };
        let (key, context) = self.setup_execution_context(rank, buffers, sizes, plan, stream)?;
        let context = lock(&context);
        if let Err(e) = context.proxy_service.check() {
            drop(context);
            self.evict(&key);
            return Err(e);
        }
        self.launch_kernel(&context, rank, send_buff, recv_buff, data_type, stream, packet_type)
    }

    fn evict(&self, key: &ExecutionContextKey) {
        if lock(&self.contexts).remove(key).is_some() {
            log::warn!("Evicted execution context {:?} after a proxy failure", key);
        }
    }

    fn setup_execution_context(
        &self,
        rank: usize,
        buffers: UserBuffers,
        sizes: MessageSizes,
        plan: &ExecutionPlan,
        stream: Stream,
    ) -> Result<(ExecutionContextKey, Arc<Mutex<ExecutionContext>>)> {
        let key = ExecutionContextKey {
            send_buff: buffers.send.0,
            recv_buff: buffers.recv.0,
            send_buff_size: buffers.send.1,
            recv_buff_size: buffers.recv.1,
            plan: plan.name().to_string(),
        };
        let build_lock = Arc::clone(lock(&self.build_locks).entry(key.clone()).or_default());
        let _building = lock(&build_lock);

        if let Some(cached) = self.cached_context(&key) {
            let mut context = lock(&cached);
            if plan.loaded_sizes().is_some() {
                plan.operations_reset();
                plan.light_load(sizes)?;
            } else {
                // another instance of the same plan built this context
                plan.reset();
                plan.load(sizes)?;
            }
            self.setup_device_execution_plan(&mut context, rank, plan)?;
            self.upload_device_execution_plans(&mut context, stream)?;
            self.stats.light_reloads.fetch_add(1, Ordering::Relaxed);
            log::debug!("Execution context cache hit for {:?}", key);
            drop(context);
            return Ok((key, cached));
        }
        log::debug!("Execution context cache miss for {:?}", key);

        // Bootstrap tags do not tell concurrent builds apart, so builds of
        // all keys take turns, in the same order on every rank.
        let _setup = self.comm.lock_setup();
        plan.reset();
        plan.load(sizes)?;
        let scratch_buffer_size =
            plan.scratch_buffer_size(rank, buffers.send.1 as u64, buffers.recv.1 as u64)? as usize;
        let scratch_buffer = if scratch_buffer_size > 0 {
            Some(DeviceBuffer::zeroed(self.comm.device(), scratch_buffer_size)?)
        } else {
            None
        };
        let mut context = ExecutionContext {
            proxy_service: ProxyService::new(&self.comm)?,
            connections: HashMap::new(),
            registered_memories: HashMap::new(),
            local_memories: Vec::new(),
            sm_semaphores: Vec::new(),
            proxy_semaphores: Vec::new(),
            sm_channels: Vec::new(),
            proxy_channels: Vec::new(),
            device_execution_plans: Vec::new(),
            device_execution_plans_buffer: None,
            scratch_buffer,
            scratch_buffer_size,
            num_threads_per_block: plan.num_threads_per_block(),
        };
        self.setup_connections(&mut context, rank, plan)?;
        self.setup_registered_memories(&mut context, &buffers, rank, plan)?;
        self.setup_channels(&mut context, &buffers, rank, plan)?;
        self.setup_device_execution_plan(&mut context, rank, plan)?;
        self.upload_device_execution_plans(&mut context, stream)?;
        context.proxy_service.start_proxy()?;
        log::info!(
            "Built execution context of plan {} on rank {}: {} connections, {} SM channels, {} proxy channels, {} thread blocks",
            key.plan,
            rank,
            context.connections.len(),
            context.sm_channels.len(),
            context.proxy_channels.len(),
            context.device_execution_plans.len()
        );

        let context = Arc::new(Mutex::new(context));
        let mut contexts = lock(&self.contexts);
        if let Some(limit) = self.max_cached_contexts {
            if contexts.len() >= limit {
                log::debug!("Execution context cache full ({}), clearing", contexts.len());
                contexts.clear();
            }
        }
        contexts.insert(key.clone(), Arc::clone(&context));
        self.stats.full_builds.fetch_add(1, Ordering::Relaxed);
        Ok((key, context))
    }

    fn transport_for(&self, rank: usize, peer: usize) -> Result<Transport> {
        let nranks_per_node = self.comm.num_ranks_per_node();
        if in_same_node(rank, peer, nranks_per_node) {
            Ok(Transport::CudaIpc)
        } else {
            inter_node_transport(rank, nranks_per_node)
        }
    }

    fn transport_flags(&self, infos: &[ChannelInfo], rank: usize) -> Result<TransportFlags> {
        let mut flags = TransportFlags::empty();
        for info in infos {
            match info.channel_type {
                ChannelType::Sm => flags |= TransportFlags::CUDA_IPC,
                ChannelType::Proxy => {
                    for &peer in &info.connected_peers {
                        flags |= self.transport_for(rank, peer)?.flag();
                    }
                }
                ChannelType::None => {}
            }
        }
        Ok(flags)
    }

    fn setup_connections(&self, context: &mut ExecutionContext, rank: usize, plan: &ExecutionPlan) -> Result<()> {
        let peers = plan.connected_peers(rank)?;
        let mut batch = SetupBatch::new();
        let mut futures = Vec::with_capacity(peers.len());
        for peer in peers {
            let transport = self.transport_for(rank, peer)?;
            futures.push((
                peer,
                self.comm
                    .connect_on_setup(&mut batch, peer, CONNECTION_TAG, transport)?,
            ));
        }
        self.comm.setup(batch)?;
        for (peer, future) in futures {
            context.connections.insert(peer, future.get()?);
        }
        Ok(())
    }

    fn setup_registered_memories(
        &self,
        context: &mut ExecutionContext,
        buffers: &UserBuffers,
        rank: usize,
        plan: &ExecutionPlan,
    ) -> Result<()> {
        fn peers_of(infos: &[ChannelInfo]) -> BTreeSet<usize> {
            infos
                .iter()
                .flat_map(|info| info.connected_peers.iter().copied())
                .collect()
        }

        for role in plan.connected_buffer_types(rank)? {
            let tag = role as u32;
            let mut batch = SetupBatch::new();

            // peers writing into this rank's buffer of `role` need its descriptor
            let readers = plan.channel_infos_by_dst_rank(rank, role)?;
            let flags = self.transport_flags(&readers, rank)?;
            if !flags.is_empty() {
                let (addr, size) = context.buffer(buffers, role)?;
                let memory = self.comm.register_memory(addr, size, flags)?;
                for peer in peers_of(&readers) {
                    self.comm.send_memory_on_setup(&mut batch, &memory, peer, tag);
                }
                context.local_memories.push(memory);
            }

            let targets = plan.channel_infos(rank, role)?;
            let futures: Vec<(usize, SetupFuture<RegisteredMemory>)> = peers_of(&targets)
                .into_iter()
                .map(|peer| (peer, self.comm.recv_memory_on_setup(&mut batch, peer, tag)))
                .collect();
            self.comm.setup(batch)?;
            for (peer, future) in futures {
                context.registered_memories.insert((role, peer), future.get()?);
            }
        }
        Ok(())
    }

    fn setup_channels(
        &self,
        context: &mut ExecutionContext,
        buffers: &UserBuffers,
        rank: usize,
        plan: &ExecutionPlan,
    ) -> Result<()> {
        let connection = |context: &ExecutionContext, peer: usize| {
            context
                .connections
                .get(&peer)
                .cloned()
                .ok_or_else(|| Error::Executor(format!("No connection to rank {}", peer)))
        };

        // A semaphore handshake needs both ends, so one-way channels of the
        // peers get a matching semaphore here as well.
        let nranks = self.comm.num_ranks();
        let mut batch = SetupBatch::new();
        for class in ChannelType::CLASSES {
            let mut infos = plan.channel_infos_by_type(rank, class)?;
            infos.extend(plan.unpaired_channel_infos(rank, nranks, class)?);
            for info in &infos {
                for &peer in &info.connected_peers {
                    let conn = connection(context, peer)?;
                    match class {
                        ChannelType::Sm => {
                            let semaphore = DeviceSemaphore::new(&self.comm, &mut batch, conn)?;
                            context.sm_semaphores.push(Arc::new(semaphore));
                        }
                        ChannelType::Proxy => {
                            let id = context
                                .proxy_service
                                .build_and_add_semaphore(&self.comm, &mut batch, conn)?;
                            context.proxy_semaphores.push(id);
                        }
                        ChannelType::None => {}
                    }
                }
            }
        }
        self.comm.setup(batch)?;

        for class in ChannelType::CLASSES {
            let infos = plan.channel_infos_by_type(rank, class)?;
            let flags = self.transport_flags(&infos, rank)?;
            let mut index = 0;
            for info in &infos {
                let (src, size) = context.buffer(buffers, info.src_buffer_type)?;
                let local = match class {
                    ChannelType::Proxy => Some(self.comm.register_memory(src, size, flags)?),
                    _ => None,
                };
                for &peer in &info.connected_peers {
                    let remote = context
                        .registered_memories
                        .get(&(info.dst_buffer_type, peer))
                        .cloned()
                        .ok_or_else(|| {
                            Error::Executor(format!(
                                "No {} memory of rank {} was exchanged",
                                info.dst_buffer_type, peer
                            ))
                        })?;
                    match (class, &local) {
                        (ChannelType::Sm, _) => {
                            let semaphore = context.sm_semaphores.get(index).cloned().ok_or_else(|| {
                                Error::Internal(format!("Missing SM semaphore {}", index))
                            })?;
                            context.sm_channels.push(SmChannel::new(semaphore, remote, src)?);
                        }
                        (ChannelType::Proxy, Some(local)) => {
                            let id = context.proxy_semaphores.get(index).copied().ok_or_else(|| {
                                Error::Internal(format!("Missing proxy semaphore {}", index))
                            })?;
                            let proxy = &mut context.proxy_service;
                            let channel = SimpleProxyChannel::new(
                                proxy.proxy_channel(id)?,
                                proxy.add_memory(remote)?,
                                proxy.add_memory(local.clone())?,
                            );
                            context.proxy_channels.push(channel);
                        }
                        _ => {}
                    }
                    index += 1;
                }
                if let Some(local) = local {
                    context.local_memories.push(local);
                }
            }
        }
        Ok(())
    }

    fn setup_device_execution_plan(
        &self,
        context: &mut ExecutionContext,
        rank: usize,
        plan: &ExecutionPlan,
    ) -> Result<()> {
        let threadblocks = plan.threadblock_count(rank)?;
        let mut plans = Vec::with_capacity(threadblocks);
        for threadblock in 0..threadblocks {
            let operations = plan.operations(rank, threadblock)?;
            let sm_channels = plan
                .threadblock_sm_channels(rank, threadblock)?
                .into_iter()
                .map(|index| {
                    context
                        .sm_channels
                        .get(index)
                        .ok_or_else(|| Error::Executor(format!("Unknown SM channel {}", index)))?
                        .device_handle()
                })
                .collect::<Result<Vec<_>>>()?;
            let proxy_channels = plan
                .threadblock_proxy_channels(rank, threadblock)?
                .into_iter()
                .map(|index| {
                    context
                        .proxy_channels
                        .get(index)
                        .map(|channel| channel.device_handle())
                        .ok_or_else(|| Error::Executor(format!("Unknown proxy channel {}", index)))
                })
                .collect::<Result<Vec<_>>>()?;
            plans.push(DeviceExecutionPlan::new(&sm_channels, &proxy_channels, &operations)?);
        }
        context.device_execution_plans = plans;
        Ok(())
    }

    // Copies on the launch stream, so a kernel still reading the previous
    // records finishes before they are overwritten.
    fn upload_device_execution_plans(&self, context: &mut ExecutionContext, stream: Stream) -> Result<()> {
        let device = self.comm.device();
        let bytes = DeviceExecutionPlan::as_bytes(&context.device_execution_plans);
        if bytes.is_empty() {
            context.device_execution_plans_buffer = None;
            return Ok(());
        }
        let reusable = matches!(
            &context.device_execution_plans_buffer,
            Some(buffer) if buffer.size() == bytes.len()
        );
        if !reusable {
            context.device_execution_plans_buffer = Some(DeviceBuffer::new(device, bytes.len())?);
        }
        if let Some(buffer) = &context.device_execution_plans_buffer {
            device.memcpy_htod_async(buffer.as_ptr(), bytes, stream)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_kernel(
        &self,
        context: &ExecutionContext,
        rank: usize,
        send_buff: usize,
        recv_buff: usize,
        data_type: DataType,
        stream: Stream,
        packet_type: PacketType,
    ) -> Result<()> {
        let num_threadblocks = context.device_execution_plans.len();
        #[cfg(feature = "npkit")]
        if num_threadblocks > NPKIT_MAX_NUM_GPU_THREADBLOCKS {
            return Err(Error::Executor(format!(
                "Executor plan launching {} thread blocks, exceeding NPKit support ({})",
                num_threadblocks, NPKIT_MAX_NUM_GPU_THREADBLOCKS
            )));
        }
        let launch = KernelLaunch {
            packet_type,
            rank,
            num_threadblocks: num_threadblocks as u32,
            num_threads_per_block: context.num_threads_per_block,
            src: send_buff,
            dst: recv_buff,
            scratch: context.scratch_buffer_addr(),
            scratch_size: context.scratch_buffer_size,
            data_type,
            plans: context.device_execution_plans_addr(),
            shared_mem_size: shared_memory_size(),
            stream,
            flag: self.flag.fetch_add(1, Ordering::Relaxed),
        };
        self.comm.device().launch(&launch)?;
        self.stats.launches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let contexts = lock(&self.contexts).len();
        if contexts > 0 {
            log::debug!("Dropping executor with {} cached contexts", contexts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::LocalBootstrap;
    use crate::gpu::HostDevice;

    fn executor() -> Executor {
        let bootstrap = LocalBootstrap::create(1, 1).pop().unwrap();
        let comm = Communicator::builder(Arc::new(bootstrap))
            .device(HostDevice::shared(0))
            .build()
            .unwrap();
        Executor::new(Arc::new(comm))
    }

    fn key(plan: &str, send_buff: usize) -> ExecutionContextKey {
        ExecutionContextKey {
            send_buff,
            recv_buff: send_buff + 0x1000,
            send_buff_size: 64,
            recv_buff_size: 64,
            plan: plan.to_string(),
        }
    }

    #[test]
    fn build_locks_in_use_survive_eviction() {
        let executor = executor();
        let held = Arc::clone(lock(&executor.build_locks).entry(key("a", 1)).or_default());
        lock(&executor.build_locks).entry(key("a", 2)).or_default();
        lock(&executor.build_locks).entry(key("b", 3)).or_default();

        assert_eq!(executor.invalidate("a"), 0);
        {
            let locks = lock(&executor.build_locks);
            assert!(Arc::ptr_eq(&held, &locks[&key("a", 1)]));
            assert!(!locks.contains_key(&key("a", 2)));
            assert!(locks.contains_key(&key("b", 3)));
        }

        executor.clear_cache();
        assert_eq!(
            lock(&executor.build_locks).keys().cloned().collect::<Vec<_>>(),
            vec![key("a", 1)]
        );
        drop(held);
        executor.clear_cache();
        assert!(lock(&executor.build_locks).is_empty());
    }
}
