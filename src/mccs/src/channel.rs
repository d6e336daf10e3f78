//! Channels pair a semaphore with the memories a thread block moves data
//! between. Only their POD device handles reach the kernel.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::RegisteredMemory;
use crate::proxy::{MemoryId, ProxyChannel, ProxyChannelDeviceHandle};
use crate::semaphore::{DeviceSemaphore, DeviceSemaphoreHandle};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SmChannelDeviceHandle {
    pub semaphore: DeviceSemaphoreHandle,
    pub dst: u64,
    pub src: u64,
    pub get_packet_buffer: u64,
}

/// Direct peer-memory channel: the device reads and writes `dst` itself.
pub struct SmChannel {
    semaphore: Arc<DeviceSemaphore>,
    dst: RegisteredMemory,
    src: usize,
    get_packet_buffer: usize,
}

impl SmChannel {
    pub fn new(semaphore: Arc<DeviceSemaphore>, dst: RegisteredMemory, src: usize) -> Result<Self> {
        if dst.data() == 0 {
            return Err(Error::InvalidUsage(format!(
                "Memory of rank {} is not mapped for a peer channel",
                dst.rank()
            )));
        }
        Ok(SmChannel {
            semaphore,
            dst,
            src,
            get_packet_buffer: 0,
        })
    }

    pub fn semaphore(&self) -> &Arc<DeviceSemaphore> {
        &self.semaphore
    }

    pub fn dst(&self) -> &RegisteredMemory {
        &self.dst
    }

    pub fn device_handle(&self) -> Result<SmChannelDeviceHandle> {
        Ok(SmChannelDeviceHandle {
            semaphore: self.semaphore.device_handle()?,
            dst: self.dst.data() as u64,
            src: self.src as u64,
            get_packet_buffer: self.get_packet_buffer as u64,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SimpleProxyChannelDeviceHandle {
    pub proxy_channel: ProxyChannelDeviceHandle,
    pub dst: MemoryId,
    pub src: MemoryId,
}

/// Proxy channel bound to one destination and one source memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimpleProxyChannel {
    proxy_channel: ProxyChannel,
    dst: MemoryId,
    src: MemoryId,
}

impl SimpleProxyChannel {
    pub fn new(proxy_channel: ProxyChannel, dst: MemoryId, src: MemoryId) -> Self {
        SimpleProxyChannel {
            proxy_channel,
            dst,
            src,
        }
    }

    #[inline]
    pub fn proxy_channel(&self) -> &ProxyChannel {
        &self.proxy_channel
    }

    #[inline]
    pub fn dst(&self) -> MemoryId {
        self.dst
    }

    #[inline]
    pub fn src(&self) -> MemoryId {
        self.src
    }

    pub fn device_handle(&self) -> SimpleProxyChannelDeviceHandle {
        SimpleProxyChannelDeviceHandle {
            proxy_channel: self.proxy_channel.device_handle(),
            dst: self.dst,
            src: self.src,
        }
    }
}
