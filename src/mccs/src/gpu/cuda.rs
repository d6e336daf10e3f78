//! CUDA backend: runtime API for memory and streams, driver API for address
//! ranges, and the execution kernels from `libmccs_kernels`.

use std::ffi::{c_int, c_void};
use std::mem::MaybeUninit;

use cuda_driver_sys::{cuMemGetAddressRange_v2, cudaError_enum, CUdeviceptr};
use cuda_runtime_sys::cudaMemcpyKind::{
    cudaMemcpyDefault, cudaMemcpyDeviceToHost, cudaMemcpyHostToDevice,
};
use cuda_runtime_sys::{
    cudaError, cudaFree, cudaIpcCloseMemHandle, cudaIpcGetMemHandle, cudaIpcMemHandle_t,
    cudaIpcOpenMemHandle, cudaMalloc, cudaMemcpy, cudaMemcpyAsync, cudaSetDevice,
    cudaStreamCreateWithFlags, cudaStreamDestroy, cudaStreamNonBlocking, cudaStreamSynchronize,
    cudaStream_t,
};

use super::ptr::DeviceNonNull;
use super::{Device, DeviceError, IpcMemHandle, Stream, IPC_HANDLE_SIZE};
use crate::kernel::{KernelLaunch, PacketType};

const CUDA_IPC_MEM_LAZY_ENABLE_PEER_ACCESS: u32 = 0x1;

#[link(name = "mccs_kernels")]
extern "C" {
    fn mccs_execution_kernel_launch_ll16(
        rank: c_int,
        nthreadblocks: c_int,
        nthreads_per_block: c_int,
        src: *mut c_void,
        dst: *mut c_void,
        scratch: *mut c_void,
        scratch_size: usize,
        data_type: u32,
        plans: *mut c_void,
        shared_mem_size: usize,
        stream: cudaStream_t,
        flag: u32,
    ) -> cudaError;

    fn mccs_execution_kernel_launch_ll8(
        rank: c_int,
        nthreadblocks: c_int,
        nthreads_per_block: c_int,
        src: *mut c_void,
        dst: *mut c_void,
        scratch: *mut c_void,
        scratch_size: usize,
        data_type: u32,
        plans: *mut c_void,
        shared_mem_size: usize,
        stream: cudaStream_t,
        flag: u32,
    ) -> cudaError;
}

fn check(err: cudaError) -> Result<(), DeviceError> {
    if err == cudaError::cudaSuccess {
        Ok(())
    } else {
        Err(DeviceError::Cuda(format!("{:?}", err)))
    }
}

pub struct CudaDevice {
    index: i32,
}

impl CudaDevice {
    pub fn new(index: i32) -> Result<Self, DeviceError> {
        unsafe { check(cudaSetDevice(index))? };
        Ok(CudaDevice { index })
    }

    fn activate(&self) -> Result<(), DeviceError> {
        unsafe { check(cudaSetDevice(self.index)) }
    }
}

impl Device for CudaDevice {
    fn device_index(&self) -> i32 {
        self.index
    }

    fn alloc(&self, size: usize) -> Result<DeviceNonNull<u8>, DeviceError> {
        self.activate()?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        unsafe { check(cudaMalloc(&mut ptr, size))? };
        DeviceNonNull::new(ptr as *mut u8).ok_or(DeviceError::OutOfMemory(size))
    }

    fn free(&self, ptr: DeviceNonNull<u8>) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe { check(cudaFree(ptr.as_ptr() as *mut c_void)) }
    }

    fn memcpy_htod(&self, dst: DeviceNonNull<u8>, src: &[u8]) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe {
            check(cudaMemcpy(
                dst.as_ptr() as *mut c_void,
                src.as_ptr() as *const c_void,
                src.len(),
                cudaMemcpyHostToDevice,
            ))
        }
    }

    fn memcpy_htod_async(
        &self,
        dst: DeviceNonNull<u8>,
        src: &[u8],
        stream: Stream,
    ) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe {
            check(cudaMemcpyAsync(
                dst.as_ptr() as *mut c_void,
                src.as_ptr() as *const c_void,
                src.len(),
                cudaMemcpyHostToDevice,
                stream as cudaStream_t,
            ))
        }
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DeviceNonNull<u8>) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe {
            check(cudaMemcpy(
                dst.as_mut_ptr() as *mut c_void,
                src.as_ptr() as *const c_void,
                dst.len(),
                cudaMemcpyDeviceToHost,
            ))
        }
    }

    fn memcpy_dtod_async(
        &self,
        dst: DeviceNonNull<u8>,
        src: DeviceNonNull<u8>,
        size: usize,
        stream: Stream,
    ) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe {
            check(cudaMemcpyAsync(
                dst.as_ptr() as *mut c_void,
                src.as_ptr() as *const c_void,
                size,
                cudaMemcpyDefault,
                stream as cudaStream_t,
            ))
        }
    }

    fn address_range(&self, addr: usize) -> Result<(usize, usize), DeviceError> {
        self.activate()?;
        let mut base: CUdeviceptr = 0;
        let mut size: usize = 0;
        let res = unsafe { cuMemGetAddressRange_v2(&mut base, &mut size, addr as CUdeviceptr) };
        if res != cudaError_enum::CUDA_SUCCESS {
            return Err(DeviceError::UnknownAddress(addr));
        }
        Ok((base as usize, size))
    }

    fn ipc_handle(&self, base: usize) -> Result<IpcMemHandle, DeviceError> {
        self.activate()?;
        let mut handle = MaybeUninit::<cudaIpcMemHandle_t>::zeroed();
        unsafe {
            check(cudaIpcGetMemHandle(handle.as_mut_ptr(), base as *mut c_void))?;
            let handle = handle.assume_init();
            let mut bytes = [0u8; IPC_HANDLE_SIZE];
            for (dst, src) in bytes.iter_mut().zip(handle.reserved.iter()) {
                *dst = *src as u8;
            }
            Ok(IpcMemHandle(bytes))
        }
    }

    fn open_ipc_handle(&self, handle: &IpcMemHandle) -> Result<usize, DeviceError> {
        self.activate()?;
        let mut raw = MaybeUninit::<cudaIpcMemHandle_t>::zeroed();
        let mut ptr: *mut c_void = std::ptr::null_mut();
        unsafe {
            let raw = raw.assume_init_mut();
            for (dst, src) in raw.reserved.iter_mut().zip(handle.0.iter()) {
                *dst = *src as _;
            }
            check(cudaIpcOpenMemHandle(
                &mut ptr,
                *raw,
                CUDA_IPC_MEM_LAZY_ENABLE_PEER_ACCESS,
            ))
            .map_err(|_| DeviceError::InvalidIpcHandle)?;
        }
        Ok(ptr as usize)
    }

    fn close_ipc_handle(&self, base: usize) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe { check(cudaIpcCloseMemHandle(base as *mut c_void)) }
    }

    fn create_stream(&self) -> Result<Stream, DeviceError> {
        self.activate()?;
        let mut stream = MaybeUninit::<cudaStream_t>::uninit();
        unsafe {
            check(cudaStreamCreateWithFlags(
                stream.as_mut_ptr(),
                cudaStreamNonBlocking,
            ))?;
            Ok(stream.assume_init() as Stream)
        }
    }

    fn destroy_stream(&self, stream: Stream) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe { check(cudaStreamDestroy(stream as cudaStream_t)) }
    }

    fn stream_synchronize(&self, stream: Stream) -> Result<(), DeviceError> {
        self.activate()?;
        unsafe { check(cudaStreamSynchronize(stream as cudaStream_t)) }
    }

    fn launch(&self, launch: &KernelLaunch) -> Result<(), DeviceError> {
        self.activate()?;
        let kernel = match launch.packet_type {
            PacketType::LL16 => mccs_execution_kernel_launch_ll16,
            PacketType::LL8 => mccs_execution_kernel_launch_ll8,
        };
        let err = unsafe {
            kernel(
                launch.rank as c_int,
                launch.num_threadblocks as c_int,
                launch.num_threads_per_block as c_int,
                launch.src as *mut c_void,
                launch.dst as *mut c_void,
                launch.scratch as *mut c_void,
                launch.scratch_size,
                launch.data_type as u32,
                launch.plans as *mut c_void,
                launch.shared_mem_size,
                launch.stream as cudaStream_t,
                launch.flag,
            )
        };
        check(err).map_err(|e| DeviceError::Launch(e.to_string()))
    }
}
