use std::num::NonZeroUsize;
use std::sync::Arc;

use super::ptr::DeviceNonNull;
use super::{Device, DeviceError};

/// Owned device allocation, released on drop.
pub struct DeviceBuffer {
    ptr: DeviceNonNull<u8>,
    size: usize,
    device: Arc<dyn Device>,
}

impl DeviceBuffer {
    pub fn new(device: &Arc<dyn Device>, size: usize) -> Result<Self, DeviceError> {
        let ptr = device.alloc(size)?;
        Ok(DeviceBuffer {
            ptr,
            size,
            device: Arc::clone(device),
        })
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(device: &Arc<dyn Device>, data: &[u8]) -> Result<Self, DeviceError> {
        let buffer = Self::new(device, data.len())?;
        buffer.device.memcpy_htod(buffer.ptr, data)?;
        Ok(buffer)
    }

    pub fn zeroed(device: &Arc<dyn Device>, size: usize) -> Result<Self, DeviceError> {
        Self::from_slice(device, &vec![0u8; size])
    }

    #[must_use]
    #[inline]
    pub fn addr(&self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> DeviceNonNull<u8> {
        self.ptr
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read(&self) -> Result<Vec<u8>, DeviceError> {
        let mut data = vec![0u8; self.size];
        self.device.memcpy_dtoh(data.as_mut_slice(), self.ptr)?;
        Ok(data)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.free(self.ptr) {
            log::error!("Failed to free device buffer {:p}: {}", self.ptr, e);
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
