//! Host-memory emulation of a device.
//!
//! Allocations live in one process-wide table, so every `HostDevice` in the
//! process can open the IPC handles of every other one, the same way peer
//! GPUs on one node can map each other's memory. Kernel launches are
//! recorded rather than executed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use once_cell::sync::Lazy;
use spin::Mutex;

use super::ptr::DeviceNonNull;
use super::{Device, DeviceError, IpcMemHandle, Stream, IPC_HANDLE_SIZE};
use crate::kernel::KernelLaunch;

const HOST_IPC_MAGIC: u64 = 0x6d63_6373_6970_6300;

struct HostAllocation {
    // u64 words keep every allocation 8-byte aligned for semaphore counters
    storage: Box<[u64]>,
    size: usize,
    device: i32,
}

impl HostAllocation {
    fn base(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    fn extent(&self) -> usize {
        self.size.max(1)
    }
}

static ALLOCATIONS: Lazy<Mutex<BTreeMap<usize, HostAllocation>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

fn check_range(
    table: &BTreeMap<usize, HostAllocation>,
    addr: usize,
    size: usize,
) -> Result<(), DeviceError> {
    let (_, alloc) = table
        .range(..=addr)
        .next_back()
        .ok_or(DeviceError::UnknownAddress(addr))?;
    if addr >= alloc.base() + alloc.extent() {
        return Err(DeviceError::UnknownAddress(addr));
    }
    match addr.checked_add(size) {
        Some(end) if end <= alloc.base() + alloc.size => Ok(()),
        _ => Err(DeviceError::OutOfRange(addr, size)),
    }
}

/// A host to device copy issued on a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamUpload {
    pub stream: Stream,
    pub dst: usize,
    pub size: usize,
}

pub struct HostDevice {
    index: i32,
    next_stream: AtomicUsize,
    launches: Mutex<Vec<KernelLaunch>>,
    uploads: Mutex<Vec<StreamUpload>>,
}

impl HostDevice {
    pub fn new(index: i32) -> Self {
        HostDevice {
            index,
            next_stream: AtomicUsize::new(1),
            launches: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(index: i32) -> Arc<dyn Device> {
        Arc::new(Self::new(index))
    }

    /// Kernel launches issued on this device so far.
    pub fn launches(&self) -> Vec<KernelLaunch> {
        self.launches.lock().clone()
    }

    /// Stream ordered host to device copies issued so far.
    pub fn stream_uploads(&self) -> Vec<StreamUpload> {
        self.uploads.lock().clone()
    }

    /// Number of live allocations owned by this device.
    pub fn num_allocations(&self) -> usize {
        ALLOCATIONS
            .lock()
            .values()
            .filter(|a| a.device == self.index)
            .count()
    }
}

impl Device for HostDevice {
    fn device_index(&self) -> i32 {
        self.index
    }

    fn alloc(&self, size: usize) -> Result<DeviceNonNull<u8>, DeviceError> {
        let words = size.div_ceil(8).max(1);
        let storage = vec![0u64; words].into_boxed_slice();
        let alloc = HostAllocation {
            storage,
            size,
            device: self.index,
        };
        let base = alloc.base();
        ALLOCATIONS.lock().insert(base, alloc);
        DeviceNonNull::from_addr(base).ok_or(DeviceError::OutOfMemory(size))
    }

    fn free(&self, ptr: DeviceNonNull<u8>) -> Result<(), DeviceError> {
        let addr = ptr.addr().get();
        ALLOCATIONS
            .lock()
            .remove(&addr)
            .map(|_| ())
            .ok_or(DeviceError::UnknownAddress(addr))
    }

    fn memcpy_htod(&self, dst: DeviceNonNull<u8>, src: &[u8]) -> Result<(), DeviceError> {
        let table = ALLOCATIONS.lock();
        check_range(&table, dst.addr().get(), src.len())?;
        unsafe {
            std::ptr::copy(src.as_ptr(), dst.as_ptr(), src.len());
        }
        Ok(())
    }

    fn memcpy_htod_async(
        &self,
        dst: DeviceNonNull<u8>,
        src: &[u8],
        stream: Stream,
    ) -> Result<(), DeviceError> {
        // launches are only recorded, so the copy may land right away
        self.memcpy_htod(dst, src)?;
        self.uploads.lock().push(StreamUpload {
            stream,
            dst: dst.addr().get(),
            size: src.len(),
        });
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DeviceNonNull<u8>) -> Result<(), DeviceError> {
        let table = ALLOCATIONS.lock();
        check_range(&table, src.addr().get(), dst.len())?;
        unsafe {
            std::ptr::copy(src.as_ptr() as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn memcpy_dtod_async(
        &self,
        dst: DeviceNonNull<u8>,
        src: DeviceNonNull<u8>,
        size: usize,
        _stream: Stream,
    ) -> Result<(), DeviceError> {
        let table = ALLOCATIONS.lock();
        check_range(&table, dst.addr().get(), size)?;
        check_range(&table, src.addr().get(), size)?;
        unsafe {
            std::ptr::copy(src.as_ptr() as *const u8, dst.as_ptr(), size);
        }
        Ok(())
    }

    fn address_range(&self, addr: usize) -> Result<(usize, usize), DeviceError> {
        let table = ALLOCATIONS.lock();
        let (base, alloc) = table
            .range(..=addr)
            .next_back()
            .ok_or(DeviceError::UnknownAddress(addr))?;
        if addr >= *base + alloc.extent() {
            return Err(DeviceError::UnknownAddress(addr));
        }
        Ok((*base, alloc.size))
    }

    fn ipc_handle(&self, base: usize) -> Result<IpcMemHandle, DeviceError> {
        if !ALLOCATIONS.lock().contains_key(&base) {
            return Err(DeviceError::UnknownAddress(base));
        }
        let mut handle = [0u8; IPC_HANDLE_SIZE];
        LittleEndian::write_u64(&mut handle[0..8], HOST_IPC_MAGIC);
        LittleEndian::write_u64(&mut handle[8..16], base as u64);
        LittleEndian::write_u32(&mut handle[16..20], std::process::id());
        Ok(IpcMemHandle(handle))
    }

    fn open_ipc_handle(&self, handle: &IpcMemHandle) -> Result<usize, DeviceError> {
        let magic = LittleEndian::read_u64(&handle.0[0..8]);
        let base = LittleEndian::read_u64(&handle.0[8..16]) as usize;
        let pid = LittleEndian::read_u32(&handle.0[16..20]);
        if magic != HOST_IPC_MAGIC || pid != std::process::id() {
            return Err(DeviceError::InvalidIpcHandle);
        }
        if !ALLOCATIONS.lock().contains_key(&base) {
            return Err(DeviceError::InvalidIpcHandle);
        }
        Ok(base)
    }

    fn close_ipc_handle(&self, _base: usize) -> Result<(), DeviceError> {
        Ok(())
    }

    fn create_stream(&self) -> Result<Stream, DeviceError> {
        Ok(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    fn destroy_stream(&self, _stream: Stream) -> Result<(), DeviceError> {
        Ok(())
    }

    fn stream_synchronize(&self, _stream: Stream) -> Result<(), DeviceError> {
        Ok(())
    }

    fn launch(&self, launch: &KernelLaunch) -> Result<(), DeviceError> {
        log::trace!(
            "Host device {} launch {} kernel: {} blocks x {} threads, flag {}",
            self.index,
            launch.packet_type,
            launch.num_threadblocks,
            launch.num_threads_per_block,
            launch.flag
        );
        self.launches.lock().push(launch.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_range_resolves_interior_pointers() {
        let device = HostDevice::new(0);
        let ptr = device.alloc(4096).unwrap();
        let base = ptr.addr().get();
        assert_eq!(device.address_range(base + 100).unwrap(), (base, 4096));
        assert_eq!(device.address_range(base).unwrap(), (base, 4096));
        assert!(device.address_range(base + 4096).is_err());
        device.free(ptr).unwrap();
        assert!(device.address_range(base).is_err());
    }

    #[test]
    fn copies_are_bounds_checked() {
        let device = HostDevice::new(0);
        let ptr = device.alloc(16).unwrap();
        device.memcpy_htod(ptr, &[7u8; 16]).unwrap();
        let mut out = [0u8; 16];
        device.memcpy_dtoh(&mut out, ptr).unwrap();
        assert_eq!(out, [7u8; 16]);
        assert!(matches!(
            device.memcpy_htod(ptr.byte_add(8), &[0u8; 16]),
            Err(DeviceError::OutOfRange(_, 16))
        ));
        // sizes that wrap the address space
        assert!(matches!(
            device.memcpy_dtod_async(ptr.byte_add(4), ptr, usize::MAX - 2, 0),
            Err(DeviceError::OutOfRange(_, _))
        ));
        device.free(ptr).unwrap();
    }

    #[test]
    fn ipc_handles_open_across_devices() {
        let a = HostDevice::new(0);
        let b = HostDevice::new(1);
        let ptr = a.alloc(64).unwrap();
        let handle = a.ipc_handle(ptr.addr().get()).unwrap();
        assert_eq!(b.open_ipc_handle(&handle).unwrap(), ptr.addr().get());
        a.free(ptr).unwrap();
        assert!(b.open_ipc_handle(&handle).is_err());
    }
}
