use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::PlanError;

pub const MAX_CHANNEL_PER_OPERATION: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
#[repr(u8)]
pub enum BufferType {
    #[default]
    None = 0,
    Input = 1,
    Output = 2,
    Scratch = 3,
}

impl FromStr for BufferType {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i" => Ok(BufferType::Input),
            "o" => Ok(BufferType::Output),
            "s" => Ok(BufferType::Scratch),
            other => Err(PlanError::UnknownBufferType(other.to_string())),
        }
    }
}

impl TryFrom<String> for BufferType {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferType::None => "none",
            BufferType::Input => "input",
            BufferType::Output => "output",
            BufferType::Scratch => "scratch",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
#[repr(u8)]
pub enum ChannelType {
    #[default]
    None = 0,
    Sm = 1,
    Proxy = 2,
}

impl ChannelType {
    /// Channel classes in the order their semaphores are built.
    pub const CLASSES: [ChannelType; 2] = [ChannelType::Sm, ChannelType::Proxy];
}

impl FromStr for ChannelType {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ChannelType::None),
            "sm" => Ok(ChannelType::Sm),
            "proxy" => Ok(ChannelType::Proxy),
            other => Err(PlanError::UnknownChannelType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ChannelType {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
#[repr(u8)]
pub enum OperationType {
    #[default]
    Nop = 0,
    Barrier,
    Put,
    PutPacket,
    Get,
    Signal,
    Wait,
    Flush,
    Copy,
    CopyPacket,
    TransformToPacket,
    Reduce,
    ReducePacket,
    ReduceSend,
    ReduceSendPacket,
    ReadReduceCopy,
    ReadReduceCopySend,
    PutWithSignal,
    PutWithSignalAndFlush,
}

impl FromStr for OperationType {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use OperationType::*;
        let op = match s {
            "nop" => Nop,
            "barrier" => Barrier,
            "put" => Put,
            "ppkt" => PutPacket,
            "get" => Get,
            "signal" => Signal,
            "wait" => Wait,
            "flush" => Flush,
            "copy" => Copy,
            "cpkt" => CopyPacket,
            "tpkt" => TransformToPacket,
            "re" => Reduce,
            "rpkt" => ReducePacket,
            "rs" => ReduceSend,
            "rspkt" => ReduceSendPacket,
            "rrc" => ReadReduceCopy,
            "rrcs" => ReadReduceCopySend,
            "pws" => PutWithSignal,
            "pwsf" => PutWithSignalAndFlush,
            other => return Err(PlanError::UnknownOperation(other.to_string())),
        };
        Ok(op)
    }
}

impl TryFrom<String> for OperationType {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One device instruction, laid out exactly as the execution kernel reads it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Operation {
    pub op_type: OperationType,
    pub channel_type: ChannelType,
    pub src_buffer_type: BufferType,
    pub dst_buffer_type: BufferType,
    pub n_inputs: u8,
    pub n_outputs: u8,
    pub input_channel_indexes: [u8; MAX_CHANNEL_PER_OPERATION],
    pub output_channel_indexes: [u8; MAX_CHANNEL_PER_OPERATION],
    pub(crate) _pad: [u8; 2],
    pub input_offsets: [u64; MAX_CHANNEL_PER_OPERATION],
    pub output_offsets: [u64; MAX_CHANNEL_PER_OPERATION],
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selectors() {
        assert_eq!("s".parse::<BufferType>().unwrap(), BufferType::Scratch);
        assert!(matches!(
            "x".parse::<BufferType>(),
            Err(PlanError::UnknownBufferType(_))
        ));
        assert_eq!("proxy".parse::<ChannelType>().unwrap(), ChannelType::Proxy);
        assert_eq!("rspkt".parse::<OperationType>().unwrap(), OperationType::ReduceSendPacket);
        assert!("putt".parse::<OperationType>().is_err());
    }

    #[test]
    fn zeroed_operation_is_nop() {
        let op = Operation::default();
        assert_eq!(op.op_type as u8, 0);
        assert_eq!(op.channel_type, ChannelType::None);
        assert_eq!(std::mem::align_of::<Operation>(), 8);
    }
}
