//! RDMA-class fabric provider seam.
//!
//! A [`Fabric`] opens one [`FabricContext`] per device; a context registers
//! memory regions and creates queue pairs. [`SoftFabric`] is an in-process
//! loopback provider: remote keys resolve through a process-wide table and
//! one-sided operations become device copies.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::ptr::DeviceNonNull;
use crate::gpu::{Device, DeviceError};

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("Unknown fabric device {0}")]
    UnknownDevice(String),
    #[error("Queue pair {0} is not connected")]
    NotConnected(u32),
    #[error("Queue pair {0} is already connected")]
    AlreadyConnected(u32),
    #[error("Unknown remote queue pair {0}")]
    UnknownQueuePair(u32),
    #[error("Unknown memory region key {0:#x}")]
    UnknownKey(u32),
    #[error("Access of {1} bytes at offset {0} exceeds the memory region")]
    OutOfBounds(u64, u64),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Remote-visible description of a registered memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrInfo {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpInfo {
    pub lid: u16,
    pub port: u8,
    pub qpn: u32,
    pub psn: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub info: MrInfo,
    pub lkey: u32,
    pub size: u64,
}

pub trait Fabric: Send + Sync {
    fn open(&self, device_name: &str) -> Result<Arc<dyn FabricContext>, FabricError>;
}

pub trait FabricContext: Send + Sync {
    fn device_name(&self) -> &str;

    fn register_mr(&self, addr: usize, size: usize) -> Result<MemoryRegion, FabricError>;

    fn deregister_mr(&self, mr: &MemoryRegion) -> Result<(), FabricError>;

    fn create_qp(&self) -> Result<Box<dyn QueuePair>, FabricError>;
}

pub trait QueuePair: Send + Sync {
    fn info(&self) -> QpInfo;

    fn connect(&self, remote: &QpInfo) -> Result<(), FabricError>;

    // one-sided write of `size` bytes from a local region into a remote one
    fn post_write(
        &self,
        src: &MemoryRegion,
        src_offset: u64,
        dst: &MrInfo,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), FabricError>;

    fn post_atomic_store(&self, dst: &MrInfo, dst_offset: u64, value: u64)
        -> Result<(), FabricError>;

    /// Blocks until every posted work request has completed.
    fn flush(&self) -> Result<(), FabricError>;
}

struct SoftRegion {
    addr: usize,
    size: u64,
}

static SOFT_REGIONS: Lazy<DashMap<u32, SoftRegion>> = Lazy::new(DashMap::new);
static SOFT_QUEUE_PAIRS: Lazy<DashMap<u32, String>> = Lazy::new(DashMap::new);
static NEXT_KEY: AtomicU32 = AtomicU32::new(1);
static NEXT_QPN: AtomicU32 = AtomicU32::new(1);

fn resolve(key: u32, offset: u64, size: u64) -> Result<usize, FabricError> {
    let region = SOFT_REGIONS.get(&key).ok_or(FabricError::UnknownKey(key))?;
    if offset + size > region.size {
        return Err(FabricError::OutOfBounds(offset, size));
    }
    Ok(region.addr + offset as usize)
}

fn device_ptr(addr: usize) -> Result<DeviceNonNull<u8>, FabricError> {
    DeviceNonNull::from_addr(addr).ok_or(FabricError::Device(DeviceError::UnknownAddress(addr)))
}

/// Loopback fabric for ranks that share one address space.
pub struct SoftFabric {
    device: Arc<dyn Device>,
    devices: Vec<String>,
}

impl SoftFabric {
    pub fn new(device: Arc<dyn Device>, devices: Vec<String>) -> Self {
        SoftFabric { device, devices }
    }
}

impl Fabric for SoftFabric {
    fn open(&self, device_name: &str) -> Result<Arc<dyn FabricContext>, FabricError> {
        let port = self
            .devices
            .iter()
            .position(|d| d == device_name)
            .ok_or_else(|| FabricError::UnknownDevice(device_name.to_string()))?;
        log::debug!("SoftFabric opened device {}", device_name);
        Ok(Arc::new(SoftContext {
            name: device_name.to_string(),
            port: port as u8 + 1,
            device: Arc::clone(&self.device),
        }))
    }
}

struct SoftContext {
    name: String,
    port: u8,
    device: Arc<dyn Device>,
}

impl FabricContext for SoftContext {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn register_mr(&self, addr: usize, size: usize) -> Result<MemoryRegion, FabricError> {
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        SOFT_REGIONS.insert(
            key,
            SoftRegion {
                addr,
                size: size as u64,
            },
        );
        Ok(MemoryRegion {
            info: MrInfo {
                addr: addr as u64,
                rkey: key,
            },
            lkey: key,
            size: size as u64,
        })
    }

    fn deregister_mr(&self, mr: &MemoryRegion) -> Result<(), FabricError> {
        SOFT_REGIONS
            .remove(&mr.lkey)
            .map(|_| ())
            .ok_or(FabricError::UnknownKey(mr.lkey))
    }

    fn create_qp(&self) -> Result<Box<dyn QueuePair>, FabricError> {
        let qpn = NEXT_QPN.fetch_add(1, Ordering::Relaxed);
        SOFT_QUEUE_PAIRS.insert(qpn, self.name.clone());
        Ok(Box::new(SoftQueuePair {
            info: QpInfo {
                lid: 0,
                port: self.port,
                qpn,
                psn: rand::random::<u32>() & 0xff_ffff,
            },
            remote: OnceCell::new(),
            device: Arc::clone(&self.device),
        }))
    }
}

struct SoftQueuePair {
    info: QpInfo,
    remote: OnceCell<QpInfo>,
    device: Arc<dyn Device>,
}

impl SoftQueuePair {
    fn check_connected(&self) -> Result<(), FabricError> {
        match self.remote.get() {
            Some(_) => Ok(()),
            None => Err(FabricError::NotConnected(self.info.qpn)),
        }
    }
}

impl QueuePair for SoftQueuePair {
    fn info(&self) -> QpInfo {
        self.info
    }

    fn connect(&self, remote: &QpInfo) -> Result<(), FabricError> {
        if !SOFT_QUEUE_PAIRS.contains_key(&remote.qpn) {
            return Err(FabricError::UnknownQueuePair(remote.qpn));
        }
        self.remote
            .set(*remote)
            .map_err(|_| FabricError::AlreadyConnected(self.info.qpn))
    }

    fn post_write(
        &self,
        src: &MemoryRegion,
        src_offset: u64,
        dst: &MrInfo,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), FabricError> {
        self.check_connected()?;
        let src_addr = resolve(src.lkey, src_offset, size)?;
        let dst_addr = resolve(dst.rkey, dst_offset, size)?;
        self.device.memcpy_dtod_async(
            device_ptr(dst_addr)?,
            device_ptr(src_addr)?,
            size as usize,
            0,
        )?;
        Ok(())
    }

    fn post_atomic_store(
        &self,
        dst: &MrInfo,
        dst_offset: u64,
        value: u64,
    ) -> Result<(), FabricError> {
        self.check_connected()?;
        let dst_addr = resolve(dst.rkey, dst_offset, std::mem::size_of::<u64>() as u64)?;
        self.device
            .memcpy_htod(device_ptr(dst_addr)?, &value.to_ne_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), FabricError> {
        self.check_connected()
    }
}

impl Drop for SoftQueuePair {
    fn drop(&mut self) {
        SOFT_QUEUE_PAIRS.remove(&self.info.qpn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceBuffer, HostDevice};

    #[test]
    fn loopback_write_and_atomic() {
        let device = HostDevice::shared(0);
        let fabric = SoftFabric::new(Arc::clone(&device), vec!["soft_0".to_string()]);
        let ctx = fabric.open("soft_0").unwrap();
        assert!(fabric.open("mlx5_9").is_err());

        let src = DeviceBuffer::from_slice(&device, &[3u8; 64]).unwrap();
        let dst = DeviceBuffer::zeroed(&device, 64).unwrap();
        let src_mr = ctx.register_mr(src.addr().get(), 64).unwrap();
        let dst_mr = ctx.register_mr(dst.addr().get(), 64).unwrap();

        let qp_a = ctx.create_qp().unwrap();
        let qp_b = ctx.create_qp().unwrap();
        assert!(matches!(
            qp_a.post_write(&src_mr, 0, &dst_mr.info, 0, 8),
            Err(FabricError::NotConnected(_))
        ));
        qp_a.connect(&qp_b.info()).unwrap();
        qp_b.connect(&qp_a.info()).unwrap();

        qp_a.post_write(&src_mr, 0, &dst_mr.info, 16, 32).unwrap();
        qp_a.post_atomic_store(&dst_mr.info, 56, 42).unwrap();
        qp_a.flush().unwrap();
        let data = dst.read().unwrap();
        assert!(data[..16].iter().all(|b| *b == 0));
        assert!(data[16..48].iter().all(|b| *b == 3));
        assert_eq!(u64::from_ne_bytes(data[56..64].try_into().unwrap()), 42);

        assert!(matches!(
            qp_a.post_write(&src_mr, 0, &dst_mr.info, 48, 32),
            Err(FabricError::OutOfBounds(48, 32))
        ));
        ctx.deregister_mr(&src_mr).unwrap();
        ctx.deregister_mr(&dst_mr).unwrap();
    }
}
