//! On-disk JSON form of an execution plan.

use serde::Deserialize;

use super::operation::{BufferType, ChannelType, OperationType};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum Protocol {
    #[default]
    Simple,
    LL,
}

fn default_threads_per_block() -> u32 {
    1024
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlanDocument {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_threads_per_block")]
    pub num_threads_per_block: u32,
    pub gpus: Vec<GpuDocument>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GpuDocument {
    pub id: usize,
    #[serde(default)]
    pub input_chunks: u64,
    #[serde(default)]
    pub output_chunks: u64,
    #[serde(default)]
    pub scratch_chunks: u64,
    #[serde(default)]
    pub channels: Vec<ChannelDocument>,
    #[serde(default)]
    pub threadblocks: Vec<ThreadblockDocument>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelDocument {
    pub src_buff: BufferType,
    pub dst_buff: BufferType,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub connected_to: Vec<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ThreadblockDocument {
    pub id: usize,
    #[serde(default)]
    pub channels: Vec<ThreadblockChannelDocument>,
    #[serde(default)]
    pub ops: Vec<OperationDocument>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ThreadblockChannelDocument {
    pub src: BufferType,
    pub dst: BufferType,
    pub ctype: ChannelType,
    pub cids: Vec<usize>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ChannelRef {
    pub id: usize,
    pub off: u64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BufferPair {
    pub src: BufferType,
    pub dst: BufferType,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OperationDocument {
    pub name: OperationType,
    #[serde(default)]
    pub ctype: ChannelType,
    #[serde(default)]
    pub i_cids: Vec<ChannelRef>,
    #[serde(default)]
    pub o_cids: Vec<ChannelRef>,
    // channel key of the inputs/outputs; the op's own buffers when absent
    pub i_buff: Option<BufferPair>,
    pub o_buff: Option<BufferPair>,
    #[serde(default)]
    pub srcbuff: BufferType,
    #[serde(default)]
    pub srcoff: u64,
    #[serde(default)]
    pub dstbuff: BufferType,
    #[serde(default)]
    pub dstoff: u64,
    #[serde(default)]
    pub cnt: u64,
}
