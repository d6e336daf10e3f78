//! Execution plans: per-rank channel topology, thread-block channel
//! assignments and operation lists, parameterized by message size.
//!
//! A plan is parsed once from JSON. [`ExecutionPlan::load`] derives the
//! channel structure and the operations for given message sizes;
//! [`ExecutionPlan::light_load`] recomputes only the operations, so the
//! channel layout observed by an execution context never changes between
//! reloads.

pub mod document;
pub mod operation;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use spin::RwLock;
use thiserror::Error;

pub use document::{GpuDocument, PlanDocument, Protocol};
pub use operation::{BufferType, ChannelType, Operation, OperationType, MAX_CHANNEL_PER_OPERATION};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read plan: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed plan: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown buffer type {0:?}")]
    UnknownBufferType(String),
    #[error("Unknown channel type {0:?}")]
    UnknownChannelType(String),
    #[error("Unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("Rank {0} is not described by the plan")]
    UnknownRank(usize),
    #[error("Rank {0} is described twice")]
    DuplicatedRank(usize),
    #[error("Rank {0} has no thread block {1}")]
    UnknownThreadblock(usize, usize),
    #[error("Rank {rank} references undeclared channel {cid} of {key:?}")]
    UnknownChannel {
        rank: usize,
        key: ChannelKey,
        cid: usize,
    },
    #[error("Operation on rank {0} uses {1} channels of one direction")]
    TooManyChannels(usize, usize),
    #[error("Rank {0} declares no chunks for its {1} buffer")]
    NoChunks(usize, BufferType),
    #[error("Plan is not loaded")]
    NotLoaded,
}

/// Identifies a group of channels sharing buffer roles and class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub src: BufferType,
    pub dst: BufferType,
    pub channel_type: ChannelType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub src_buffer_type: BufferType,
    pub dst_buffer_type: BufferType,
    pub channel_type: ChannelType,
    pub connected_peers: Vec<usize>,
}

/// Message sizes and interior buffer offsets a plan is loaded for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageSizes {
    pub input_size: u64,
    pub output_size: u64,
    pub src_offset: u64,
    pub dst_offset: u64,
}

#[derive(Debug, Default)]
struct RankPlan {
    channel_infos: Vec<ChannelInfo>,
    // channels of other ranks targeting this one, one entry per source rank
    incoming_channel_infos: Vec<ChannelInfo>,
    // (class, peer) -> number of channels
    channel_counts: HashMap<(ChannelType, usize), usize>,
    sm_channels: Vec<Vec<usize>>,
    proxy_channels: Vec<Vec<usize>>,
    operations: Vec<Vec<Operation>>,
}

struct LoadedPlan {
    sizes: MessageSizes,
    ranks: HashMap<usize, RankPlan>,
}

pub struct ExecutionPlan {
    document: PlanDocument,
    state: RwLock<Option<LoadedPlan>>,
}

impl ExecutionPlan {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, PlanError> {
        let document: PlanDocument = serde_json::from_str(content)?;
        Ok(Self::from_document(document))
    }

    pub fn from_document(document: PlanDocument) -> Self {
        ExecutionPlan {
            document,
            state: RwLock::new(None),
        }
    }

    /// Plan identity, part of every execution context key.
    #[inline]
    pub fn name(&self) -> &str {
        &self.document.name
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.document.protocol
    }

    #[inline]
    pub fn num_threads_per_block(&self) -> u32 {
        self.document.num_threads_per_block
    }

    pub fn document(&self) -> &PlanDocument {
        &self.document
    }

    pub fn loaded_sizes(&self) -> Option<MessageSizes> {
        self.state.read().as_ref().map(|loaded| loaded.sizes)
    }

    fn gpu(&self, rank: usize) -> Result<&GpuDocument, PlanError> {
        self.document
            .gpus
            .iter()
            .find(|gpu| gpu.id == rank)
            .ok_or(PlanError::UnknownRank(rank))
    }

    fn with_rank<T>(&self, rank: usize, f: impl FnOnce(&RankPlan) -> Result<T, PlanError>) -> Result<T, PlanError> {
        let state = self.state.read();
        let loaded = state.as_ref().ok_or(PlanError::NotLoaded)?;
        let plan = loaded.ranks.get(&rank).ok_or(PlanError::UnknownRank(rank))?;
        f(plan)
    }

    pub fn reset(&self) {
        *self.state.write() = None;
    }

    /// Derives channel structure and operations of every rank.
    pub fn load(&self, sizes: MessageSizes) -> Result<(), PlanError> {
        let mut ranks = self.build_structure()?;
        for gpu in &self.document.gpus {
            let operations = self.build_operations(gpu, &sizes)?;
            if let Some(plan) = ranks.get_mut(&gpu.id) {
                plan.operations = operations;
            }
        }
        *self.state.write() = Some(LoadedPlan { sizes, ranks });
        Ok(())
    }

    pub fn operations_reset(&self) {
        if let Some(loaded) = self.state.write().as_mut() {
            for plan in loaded.ranks.values_mut() {
                plan.operations.clear();
            }
        }
    }

    /// Recomputes operations for new sizes, keeping the channel structure.
    pub fn light_load(&self, sizes: MessageSizes) -> Result<(), PlanError> {
        let mut operations = Vec::with_capacity(self.document.gpus.len());
        for gpu in &self.document.gpus {
            operations.push((gpu.id, self.build_operations(gpu, &sizes)?));
        }
        let mut state = self.state.write();
        let loaded = state.as_mut().ok_or(PlanError::NotLoaded)?;
        for (rank, ops) in operations {
            if let Some(plan) = loaded.ranks.get_mut(&rank) {
                plan.operations = ops;
            }
        }
        loaded.sizes = sizes;
        Ok(())
    }

    fn build_structure(&self) -> Result<HashMap<usize, RankPlan>, PlanError> {
        let mut ranks = HashMap::new();
        for gpu in &self.document.gpus {
            if ranks.insert(gpu.id, RankPlan::default()).is_some() {
                return Err(PlanError::DuplicatedRank(gpu.id));
            }
        }
        for gpu in &self.document.gpus {
            let rank = gpu.id;
            for channel in &gpu.channels {
                for &peer in &channel.connected_to {
                    let peer_plan = ranks.get_mut(&peer).ok_or(PlanError::UnknownRank(peer))?;
                    peer_plan.incoming_channel_infos.push(ChannelInfo {
                        src_buffer_type: channel.src_buff,
                        dst_buffer_type: channel.dst_buff,
                        channel_type: channel.channel_type,
                        connected_peers: vec![rank],
                    });
                }
                let plan = ranks.get_mut(&rank).ok_or(PlanError::UnknownRank(rank))?;
                for &peer in &channel.connected_to {
                    *plan
                        .channel_counts
                        .entry((channel.channel_type, peer))
                        .or_default() += 1;
                }
                plan.channel_infos.push(ChannelInfo {
                    src_buffer_type: channel.src_buff,
                    dst_buffer_type: channel.dst_buff,
                    channel_type: channel.channel_type,
                    connected_peers: channel.connected_to.clone(),
                });
            }

            // rank-level index of every channel, counted per class in declaration order
            let mut next_index: HashMap<ChannelType, usize> = HashMap::new();
            let mut global: HashMap<ChannelKey, Vec<usize>> = HashMap::new();
            for channel in &gpu.channels {
                let key = ChannelKey {
                    src: channel.src_buff,
                    dst: channel.dst_buff,
                    channel_type: channel.channel_type,
                };
                for _ in &channel.connected_to {
                    let counter = next_index.entry(channel.channel_type).or_default();
                    global.entry(key).or_default().push(*counter);
                    *counter += 1;
                }
            }

            let n = gpu.threadblocks.len();
            let mut sm_channels = vec![Vec::new(); n];
            let mut proxy_channels = vec![Vec::new(); n];
            let mut seen = vec![false; n];
            for threadblock in &gpu.threadblocks {
                let tb = threadblock.id;
                if tb >= n || seen[tb] {
                    return Err(PlanError::UnknownThreadblock(rank, tb));
                }
                seen[tb] = true;
                for channel in &threadblock.channels {
                    let key = ChannelKey {
                        src: channel.src,
                        dst: channel.dst,
                        channel_type: channel.ctype,
                    };
                    for &cid in &channel.cids {
                        let index = global
                            .get(&key)
                            .and_then(|indices| indices.get(cid))
                            .copied()
                            .ok_or(PlanError::UnknownChannel { rank, key, cid })?;
                        match channel.ctype {
                            ChannelType::Sm => sm_channels[tb].push(index),
                            ChannelType::Proxy => proxy_channels[tb].push(index),
                            ChannelType::None => {
                                return Err(PlanError::UnknownChannel { rank, key, cid })
                            }
                        }
                    }
                }
            }
            let plan = ranks.get_mut(&rank).ok_or(PlanError::UnknownRank(rank))?;
            plan.sm_channels = sm_channels;
            plan.proxy_channels = proxy_channels;
        }
        Ok(ranks)
    }

    fn build_operations(
        &self,
        gpu: &GpuDocument,
        sizes: &MessageSizes,
    ) -> Result<Vec<Vec<Operation>>, PlanError> {
        let chunks = ChunkLayout::new(gpu, self.document.protocol, sizes);
        let mut operations = vec![Vec::new(); gpu.threadblocks.len()];
        for threadblock in &gpu.threadblocks {
            // (key, cid) -> position in the thread block's list of that class
            let mut local: HashMap<(ChannelKey, usize), usize> = HashMap::new();
            let mut next_local: HashMap<ChannelType, usize> = HashMap::new();
            for channel in &threadblock.channels {
                let key = ChannelKey {
                    src: channel.src,
                    dst: channel.dst,
                    channel_type: channel.ctype,
                };
                for &cid in &channel.cids {
                    let counter = next_local.entry(channel.ctype).or_default();
                    local.insert((key, cid), *counter);
                    *counter += 1;
                }
            }

            let ops = operations
                .get_mut(threadblock.id)
                .ok_or(PlanError::UnknownThreadblock(gpu.id, threadblock.id))?;
            for doc in &threadblock.ops {
                let n_inputs = doc.i_cids.len();
                let n_outputs = doc.o_cids.len();
                if n_inputs.max(n_outputs) > MAX_CHANNEL_PER_OPERATION {
                    return Err(PlanError::TooManyChannels(gpu.id, n_inputs.max(n_outputs)));
                }
                let mut op = Operation {
                    op_type: doc.name,
                    channel_type: doc.ctype,
                    src_buffer_type: doc.srcbuff,
                    dst_buffer_type: doc.dstbuff,
                    n_inputs: n_inputs as u8,
                    n_outputs: n_outputs as u8,
                    ..Default::default()
                };
                let channel_index = |key: ChannelKey, cid: usize| -> Result<u8, PlanError> {
                    local
                        .get(&(key, cid))
                        .and_then(|index| u8::try_from(*index).ok())
                        .ok_or(PlanError::UnknownChannel {
                            rank: gpu.id,
                            key,
                            cid,
                        })
                };

                let (src, dst) = doc
                    .i_buff
                    .map(|pair| (pair.src, pair.dst))
                    .unwrap_or((doc.srcbuff, doc.dstbuff));
                let key = ChannelKey {
                    src,
                    dst,
                    channel_type: doc.ctype,
                };
                for (i, input) in doc.i_cids.iter().enumerate() {
                    op.input_channel_indexes[i] = channel_index(key, input.id)?;
                    op.input_offsets[i] = chunks.offset(src, input.off)?;
                }

                let (src, dst) = doc
                    .o_buff
                    .map(|pair| (pair.src, pair.dst))
                    .unwrap_or((doc.srcbuff, doc.dstbuff));
                let key = ChannelKey {
                    src,
                    dst,
                    channel_type: doc.ctype,
                };
                for (i, output) in doc.o_cids.iter().enumerate() {
                    op.output_channel_indexes[i] = channel_index(key, output.id)?;
                    op.output_offsets[i] = chunks.offset(dst, output.off)?;
                }

                op.src_offset = chunks.offset(doc.srcbuff, doc.srcoff)?;
                op.dst_offset = chunks.offset(doc.dstbuff, doc.dstoff)?;
                op.size = if doc.cnt == 0 {
                    0
                } else {
                    doc.cnt * chunks.chunk_size(doc.srcbuff)?
                };
                ops.push(op);
            }
        }
        Ok(operations)
    }

    /// Peers this rank holds a connection to: its own channel peers plus
    /// every rank with a channel targeting it.
    pub fn connected_peers(&self, rank: usize) -> Result<Vec<usize>, PlanError> {
        self.with_rank(rank, |plan| {
            let peers: BTreeSet<usize> = plan
                .channel_infos
                .iter()
                .chain(plan.incoming_channel_infos.iter())
                .flat_map(|info| info.connected_peers.iter().copied())
                .collect();
            Ok(peers.into_iter().collect())
        })
    }

    /// Destination roles of the channels this rank owns or is targeted by.
    pub fn connected_buffer_types(&self, rank: usize) -> Result<Vec<BufferType>, PlanError> {
        self.with_rank(rank, |plan| {
            let roles: BTreeSet<BufferType> = plan
                .channel_infos
                .iter()
                .chain(plan.incoming_channel_infos.iter())
                .map(|info| info.dst_buffer_type)
                .collect();
            Ok(roles.into_iter().collect())
        })
    }

    /// Channels of `rank` writing into the peers' `role` buffer.
    pub fn channel_infos(&self, rank: usize, role: BufferType) -> Result<Vec<ChannelInfo>, PlanError> {
        self.with_rank(rank, |plan| {
            Ok(plan
                .channel_infos
                .iter()
                .filter(|info| info.dst_buffer_type == role)
                .cloned()
                .collect())
        })
    }

    /// Channels of other ranks writing into this rank's `role` buffer.
    pub fn channel_infos_by_dst_rank(
        &self,
        rank: usize,
        role: BufferType,
    ) -> Result<Vec<ChannelInfo>, PlanError> {
        self.with_rank(rank, |plan| {
            Ok(plan
                .incoming_channel_infos
                .iter()
                .filter(|info| info.dst_buffer_type == role)
                .cloned()
                .collect())
        })
    }

    pub fn channel_infos_by_type(
        &self,
        rank: usize,
        channel_type: ChannelType,
    ) -> Result<Vec<ChannelInfo>, PlanError> {
        self.with_rank(rank, |plan| {
            Ok(plan
                .channel_infos
                .iter()
                .filter(|info| info.channel_type == channel_type)
                .cloned()
                .collect())
        })
    }

    /// One entry per channel a peer opens towards `rank` beyond the ones
    /// `rank` opens back, so both ends build the same number of semaphores.
    pub fn unpaired_channel_infos(
        &self,
        rank: usize,
        nranks: usize,
        channel_type: ChannelType,
    ) -> Result<Vec<ChannelInfo>, PlanError> {
        let state = self.state.read();
        let loaded = state.as_ref().ok_or(PlanError::NotLoaded)?;
        let plan = loaded.ranks.get(&rank).ok_or(PlanError::UnknownRank(rank))?;
        let mut unpaired = Vec::new();
        for peer in (0..nranks).filter(|peer| *peer != rank) {
            let mine = plan
                .channel_counts
                .get(&(channel_type, peer))
                .copied()
                .unwrap_or(0);
            let theirs = loaded
                .ranks
                .get(&peer)
                .and_then(|peer_plan| peer_plan.channel_counts.get(&(channel_type, rank)))
                .copied()
                .unwrap_or(0);
            for _ in mine..theirs {
                unpaired.push(ChannelInfo {
                    src_buffer_type: BufferType::None,
                    dst_buffer_type: BufferType::None,
                    channel_type,
                    connected_peers: vec![peer],
                });
            }
        }
        Ok(unpaired)
    }

    pub fn threadblock_count(&self, rank: usize) -> Result<usize, PlanError> {
        self.with_rank(rank, |plan| Ok(plan.sm_channels.len()))
    }

    /// Rank-level SM channel indices assigned to `threadblock`, in order.
    pub fn threadblock_sm_channels(&self, rank: usize, threadblock: usize) -> Result<Vec<usize>, PlanError> {
        self.with_rank(rank, |plan| {
            plan.sm_channels
                .get(threadblock)
                .cloned()
                .ok_or(PlanError::UnknownThreadblock(rank, threadblock))
        })
    }

    pub fn threadblock_proxy_channels(
        &self,
        rank: usize,
        threadblock: usize,
    ) -> Result<Vec<usize>, PlanError> {
        self.with_rank(rank, |plan| {
            plan.proxy_channels
                .get(threadblock)
                .cloned()
                .ok_or(PlanError::UnknownThreadblock(rank, threadblock))
        })
    }

    pub fn operations(&self, rank: usize, threadblock: usize) -> Result<Vec<Operation>, PlanError> {
        self.with_rank(rank, |plan| {
            if threadblock >= plan.sm_channels.len() {
                return Err(PlanError::UnknownThreadblock(rank, threadblock));
            }
            Ok(plan.operations.get(threadblock).cloned().unwrap_or_default())
        })
    }

    /// Scratch bytes `rank` needs for buffers of the given sizes.
    pub fn scratch_buffer_size(
        &self,
        rank: usize,
        input_size: u64,
        output_size: u64,
    ) -> Result<u64, PlanError> {
        let gpu = self.gpu(rank)?;
        if gpu.scratch_chunks == 0 {
            return Ok(0);
        }
        let sizes = MessageSizes {
            input_size,
            output_size,
            ..Default::default()
        };
        let chunks = ChunkLayout::new(gpu, self.document.protocol, &sizes);
        Ok(chunks.chunk_size(BufferType::Scratch)? * gpu.scratch_chunks)
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("name", &self.document.name)
            .field("protocol", &self.document.protocol)
            .field("nranks", &self.document.gpus.len())
            .field("loaded", &self.loaded_sizes())
            .finish()
    }
}

struct ChunkLayout<'a> {
    gpu: &'a GpuDocument,
    protocol: Protocol,
    sizes: &'a MessageSizes,
}

impl<'a> ChunkLayout<'a> {
    fn new(gpu: &'a GpuDocument, protocol: Protocol, sizes: &'a MessageSizes) -> Self {
        ChunkLayout {
            gpu,
            protocol,
            sizes,
        }
    }

    fn chunk_size(&self, role: BufferType) -> Result<u64, PlanError> {
        let gpu = self.gpu;
        let no_chunks = || PlanError::NoChunks(gpu.id, role);
        match role {
            BufferType::None => Ok(0),
            BufferType::Input if gpu.input_chunks > 0 => Ok(self.sizes.input_size / gpu.input_chunks),
            BufferType::Output if gpu.output_chunks > 0 => {
                Ok(self.sizes.output_size / gpu.output_chunks)
            }
            BufferType::Scratch => {
                let base = if gpu.input_chunks > 0 {
                    self.sizes.input_size / gpu.input_chunks
                } else if gpu.output_chunks > 0 {
                    self.sizes.output_size / gpu.output_chunks
                } else {
                    return Err(no_chunks());
                };
                // LL packets carry a flag word next to every data word
                match self.protocol {
                    Protocol::LL => Ok(base * 2),
                    Protocol::Simple => Ok(base),
                }
            }
            _ => Err(no_chunks()),
        }
    }

    fn constant_offset(&self, role: BufferType) -> u64 {
        match role {
            BufferType::Input => self.sizes.src_offset,
            BufferType::Output => self.sizes.dst_offset,
            BufferType::Scratch | BufferType::None => 0,
        }
    }

    fn offset(&self, role: BufferType, chunk_index: u64) -> Result<u64, PlanError> {
        let base = if chunk_index == 0 {
            0
        } else {
            chunk_index * self.chunk_size(role)?
        };
        Ok(base + self.constant_offset(role))
    }
}
