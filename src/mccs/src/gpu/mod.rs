//! Accelerator runtime seam: allocation, copies, address ranges, IPC handles
//! and kernel launch.

pub mod alloc;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;
pub mod ptr;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::kernel::KernelLaunch;
use ptr::DeviceNonNull;

pub use alloc::DeviceBuffer;
pub use host::{HostDevice, StreamUpload};

/// Opaque execution stream handle (a `cudaStream_t` under the CUDA backend).
pub type Stream = usize;

pub const IPC_HANDLE_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to allocate {0} bytes of device memory")]
    OutOfMemory(usize),
    #[error("Address {0:#x} does not belong to any device allocation")]
    UnknownAddress(usize),
    #[error("Access of {1} bytes at {0:#x} exceeds its allocation")]
    OutOfRange(usize, usize),
    #[error("Invalid IPC memory handle")]
    InvalidIpcHandle,
    #[error("Kernel launch failed: {0}")]
    Launch(String),
    #[error("CUDA failed with {0}")]
    Cuda(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct IpcMemHandle(#[serde(with = "BigArray")] pub [u8; IPC_HANDLE_SIZE]);

impl std::fmt::Debug for IpcMemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IpcMemHandle").field(&&self.0[..8]).finish()
    }
}

pub trait Device: Send + Sync {
    fn device_index(&self) -> i32;

    fn alloc(&self, size: usize) -> Result<DeviceNonNull<u8>, DeviceError>;

    fn free(&self, ptr: DeviceNonNull<u8>) -> Result<(), DeviceError>;

    fn memcpy_htod(&self, dst: DeviceNonNull<u8>, src: &[u8]) -> Result<(), DeviceError>;

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DeviceNonNull<u8>) -> Result<(), DeviceError>;

    // Ordered after the work already queued on `stream`. The runtime stages
    // `src` before returning, so the caller may reuse it right away.
    fn memcpy_htod_async(
        &self,
        dst: DeviceNonNull<u8>,
        src: &[u8],
        stream: Stream,
    ) -> Result<(), DeviceError>;

    // Stream ordered copy between two device addresses, possibly on different devices
    fn memcpy_dtod_async(
        &self,
        dst: DeviceNonNull<u8>,
        src: DeviceNonNull<u8>,
        size: usize,
        stream: Stream,
    ) -> Result<(), DeviceError>;

    /// Returns the base address and total size of the allocation enclosing `addr`.
    fn address_range(&self, addr: usize) -> Result<(usize, usize), DeviceError>;

    // `base` must be the start of an allocation
    fn ipc_handle(&self, base: usize) -> Result<IpcMemHandle, DeviceError>;

    fn open_ipc_handle(&self, handle: &IpcMemHandle) -> Result<usize, DeviceError>;

    fn close_ipc_handle(&self, base: usize) -> Result<(), DeviceError>;

    fn create_stream(&self) -> Result<Stream, DeviceError>;

    fn destroy_stream(&self, stream: Stream) -> Result<(), DeviceError>;

    fn stream_synchronize(&self, stream: Stream) -> Result<(), DeviceError>;

    fn launch(&self, launch: &KernelLaunch) -> Result<(), DeviceError>;
}
