use crate::channel::{SimpleProxyChannelDeviceHandle, SmChannelDeviceHandle};
use crate::error::{Error, Result};
use crate::plan::Operation;

pub const MAX_CHANNEL_PER_THREADBLOCK: usize = 16;
pub const MAX_OPERATION: usize = 64;

/// Everything one thread block of the execution kernel reads, copied into
/// shared memory at kernel start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceExecutionPlan {
    pub n_sm_channels: u8,
    pub n_proxy_channels: u8,
    pub n_operations: u16,
    pub(crate) _pad: u32,
    pub sm_channels: [SmChannelDeviceHandle; MAX_CHANNEL_PER_THREADBLOCK],
    pub proxy_channels: [SimpleProxyChannelDeviceHandle; MAX_CHANNEL_PER_THREADBLOCK],
    pub operations: [Operation; MAX_OPERATION],
}

impl Default for DeviceExecutionPlan {
    fn default() -> Self {
        DeviceExecutionPlan {
            n_sm_channels: 0,
            n_proxy_channels: 0,
            n_operations: 0,
            _pad: 0,
            sm_channels: [SmChannelDeviceHandle::default(); MAX_CHANNEL_PER_THREADBLOCK],
            proxy_channels: [SimpleProxyChannelDeviceHandle::default(); MAX_CHANNEL_PER_THREADBLOCK],
            operations: [Operation::default(); MAX_OPERATION],
        }
    }
}

impl DeviceExecutionPlan {
    pub fn new(
        sm_channels: &[SmChannelDeviceHandle],
        proxy_channels: &[SimpleProxyChannelDeviceHandle],
        operations: &[Operation],
    ) -> Result<Self> {
        if sm_channels.len() > MAX_CHANNEL_PER_THREADBLOCK
            || proxy_channels.len() > MAX_CHANNEL_PER_THREADBLOCK
        {
            return Err(Error::Executor(format!(
                "Thread block uses {} SM and {} proxy channels, at most {} each",
                sm_channels.len(),
                proxy_channels.len(),
                MAX_CHANNEL_PER_THREADBLOCK
            )));
        }
        if operations.len() > MAX_OPERATION {
            return Err(Error::Executor(format!(
                "Thread block has {} operations, at most {}",
                operations.len(),
                MAX_OPERATION
            )));
        }
        let mut plan = DeviceExecutionPlan {
            n_sm_channels: sm_channels.len() as u8,
            n_proxy_channels: proxy_channels.len() as u8,
            n_operations: operations.len() as u16,
            ..Default::default()
        };
        plan.sm_channels[..sm_channels.len()].copy_from_slice(sm_channels);
        plan.proxy_channels[..proxy_channels.len()].copy_from_slice(proxy_channels);
        plan.operations[..operations.len()].copy_from_slice(operations);
        Ok(plan)
    }

    #[inline]
    pub fn operations(&self) -> &[Operation] {
        &self.operations[..self.n_operations as usize]
    }

    /// Raw bytes of consecutive records, as uploaded to the device.
    pub fn as_bytes(plans: &[DeviceExecutionPlan]) -> &[u8] {
        // SAFETY: the record and every nested handle are repr(C) with
        // explicit padding fields, so all bytes are initialized.
        unsafe {
            std::slice::from_raw_parts(
                plans.as_ptr() as *const u8,
                std::mem::size_of_val(plans),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;
    use crate::plan::OperationType;

    #[test]
    fn layout_has_no_implicit_padding() {
        let header = 2 * size_of::<u8>() + size_of::<u16>() + size_of::<u32>();
        let expected = header
            + MAX_CHANNEL_PER_THREADBLOCK * size_of::<SmChannelDeviceHandle>()
            + MAX_CHANNEL_PER_THREADBLOCK * size_of::<SimpleProxyChannelDeviceHandle>()
            + MAX_OPERATION * size_of::<Operation>();
        assert_eq!(size_of::<DeviceExecutionPlan>(), expected);
        assert_eq!(size_of::<Operation>(), 176);
    }

    #[test]
    fn capacity_is_enforced() {
        let op = Operation {
            op_type: OperationType::Put,
            ..Default::default()
        };
        let plan = DeviceExecutionPlan::new(&[], &[], &[op]).unwrap();
        assert_eq!(plan.n_operations, 1);
        assert_eq!(plan.operations(), &[op]);

        let ops = vec![op; MAX_OPERATION + 1];
        let err = DeviceExecutionPlan::new(&[], &[], &ops).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ExecutorError);
        let channels = [SmChannelDeviceHandle::default(); MAX_CHANNEL_PER_THREADBLOCK + 1];
        assert!(DeviceExecutionPlan::new(&channels, &[], &[]).is_err());
    }

    #[test]
    fn records_are_contiguous() {
        let plans = vec![DeviceExecutionPlan::default(); 3];
        let bytes = DeviceExecutionPlan::as_bytes(&plans);
        assert_eq!(bytes.len(), 3 * size_of::<DeviceExecutionPlan>());
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
