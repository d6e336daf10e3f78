use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::executor::device_plan::DeviceExecutionPlan;
use crate::gpu::Stream;

#[cfg(feature = "npkit")]
pub const NPKIT_MAX_NUM_GPU_THREADBLOCKS: usize = 64;
#[cfg(feature = "npkit")]
pub const NPKIT_SHM_NUM_EVENTS: usize = 64;
// sizeof(NpKitEvent) on the device side
#[cfg(feature = "npkit")]
pub const NPKIT_EVENT_SIZE: usize = 16;

/// Low-latency packet encoding; each variant is a distinct kernel specialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    LL16,
    LL8,
}

impl Default for PacketType {
    fn default() -> Self {
        PacketType::LL16
    }
}

impl TryFrom<u32> for PacketType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::LL16),
            1 => Ok(PacketType::LL8),
            other => Err(Error::Executor(format!("Invalid packet type {}", other))),
        }
    }
}

impl FromStr for PacketType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LL16" => Ok(PacketType::LL16),
            "LL8" => Ok(PacketType::LL8),
            other => Err(Error::Executor(format!("Invalid packet type {}", other))),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::LL16 => f.write_str("LL16"),
            PacketType::LL8 => f.write_str("LL8"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DataType {
    Int32 = 0,
    UInt32 = 1,
    Float16 = 2,
    Float32 = 3,
    BFloat16 = 4,
}

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Float16 | DataType::BFloat16 => 2,
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int32" => Ok(DataType::Int32),
            "uint32" => Ok(DataType::UInt32),
            "float16" | "half" => Ok(DataType::Float16),
            "float32" | "float" => Ok(DataType::Float32),
            "bfloat16" => Ok(DataType::BFloat16),
            other => Err(Error::InvalidUsage(format!("Unknown data type {}", other))),
        }
    }
}

/// Arguments of one execution kernel launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelLaunch {
    pub packet_type: PacketType,
    pub rank: usize,
    pub num_threadblocks: u32,
    pub num_threads_per_block: u32,
    pub src: usize,
    pub dst: usize,
    pub scratch: usize,
    pub scratch_size: usize,
    pub data_type: DataType,
    pub plans: usize,
    pub shared_mem_size: usize,
    pub stream: Stream,
    pub flag: u32,
}

pub fn shared_memory_size() -> usize {
    let size = std::mem::size_of::<DeviceExecutionPlan>();
    #[cfg(feature = "npkit")]
    let size = size + NPKIT_SHM_NUM_EVENTS * NPKIT_EVENT_SIZE;
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn packet_type_from_raw() {
        assert_eq!(PacketType::try_from(0).unwrap(), PacketType::LL16);
        assert_eq!(PacketType::try_from(1).unwrap(), PacketType::LL8);
        let err = PacketType::try_from(7).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutorError);
    }

    #[test]
    fn packet_type_from_str() {
        assert_eq!("ll8".parse::<PacketType>().unwrap(), PacketType::LL8);
        assert!("ll128".parse::<PacketType>().is_err());
    }
}
