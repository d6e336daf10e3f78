pub mod hca;
pub mod tcp;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const HOST_ID_ENV: &str = "MCCS_HOSTID";
pub const HCA_DEVICES_ENV: &str = "MCCS_HCA_DEVICES";

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

#[cfg(feature = "cuda")]
#[macro_export]
macro_rules! cuda_warning {
    ($cuda_op:expr) => {{
        let e = $cuda_op;
        if e != cuda_runtime_sys::cudaError::cudaSuccess {
            log::error!("CUDA failed with {:?} at {}:{}.", e, file!(), line!())
        }
    }};
    ($cuda_op:expr,$ctx:expr) => {{
        let e = $cuda_op;
        if e != cuda_runtime_sys::cudaError::cudaSuccess {
            log::error!(
                "CUDA failed with {:?} at {}:{}. Context={}",
                e,
                file!(),
                line!(),
                $ctx
            )
        }
    }};
}

/// Fingerprint of the node this process runs on.
///
/// Ranks sharing a fingerprint may map each other's device memory.
pub fn host_hash() -> u64 {
    let mut hasher = DefaultHasher::new();
    match std::env::var(HOST_ID_ENV) {
        Ok(host_id) => host_id.hash(&mut hasher),
        Err(_) => {
            match nix::unistd::gethostname() {
                Ok(name) => name.to_string_lossy().hash(&mut hasher),
                Err(e) => log::warn!("gethostname failed: {}", e),
            }
            if let Ok(boot_id) = std::fs::read_to_string(BOOT_ID_PATH) {
                boot_id.trim().hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_hash_is_stable() {
        assert_eq!(host_hash(), host_hash());
    }
}
