#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use mccs::bootstrap::{Bootstrap, LocalBootstrap};
use mccs::gpu::{DeviceBuffer, HostDevice};
use mccs::{Communicator, ExecutionPlan};

pub const SENDRECV_SM: &str = include_str!("../../../../plans/sendrecv_sm.json");
pub const ALLGATHER_2X2: &str = include_str!("../../../../plans/allgather_2x2.json");

// scratch-free pull variant: a single proxy channel between two nodes
pub const PROXY_PUT: &str = r#"{
    "name": "proxy_put",
    "gpus": [
        { "id": 0, "input_chunks": 2, "output_chunks": 2,
          "channels": [ { "src_buff": "i", "dst_buff": "o", "type": "proxy", "connected_to": [1] } ],
          "threadblocks": [
            { "id": 0,
              "channels": [ { "src": "i", "dst": "o", "ctype": "proxy", "cids": [0] } ],
              "ops": [ { "name": "pwsf", "ctype": "proxy", "o_cids": [ { "id": 0, "off": 1 } ],
                         "srcbuff": "i", "srcoff": 1, "dstbuff": "o", "dstoff": 1, "cnt": 1 } ] } ] },
        { "id": 1, "input_chunks": 2, "output_chunks": 2,
          "channels": [ { "src_buff": "i", "dst_buff": "o", "type": "proxy", "connected_to": [0] } ],
          "threadblocks": [
            { "id": 0,
              "channels": [ { "src": "i", "dst": "o", "ctype": "proxy", "cids": [0] } ],
              "ops": [ { "name": "wait", "ctype": "proxy", "i_cids": [ { "id": 0, "off": 0 } ],
                         "i_buff": { "src": "i", "dst": "o" } } ] } ] }
    ]
}"#;

pub struct Rank {
    pub comm: Arc<Communicator>,
    pub device: Arc<HostDevice>,
}

impl Rank {
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn buffer(&self, size: usize) -> DeviceBuffer {
        DeviceBuffer::zeroed(self.comm.device(), size).unwrap()
    }

    pub fn plan(&self, json: &str) -> ExecutionPlan {
        ExecutionPlan::from_json(json).unwrap()
    }

    /// Exchanges one address with every other rank; entry `r` is rank `r`'s.
    pub fn all_gather_addr(&self, addr: usize) -> Vec<usize> {
        let nranks = self.comm.num_ranks();
        let mut data = vec![0u8; nranks * 8];
        let rank = self.rank();
        data[rank * 8..(rank + 1) * 8].copy_from_slice(&(addr as u64).to_le_bytes());
        self.comm.bootstrap().all_gather(&mut data, 8).unwrap();
        data.chunks_exact(8)
            .map(|slot| u64::from_le_bytes(slot.try_into().unwrap()) as usize)
            .collect()
    }
}

/// Runs `f` on one thread per rank. Every rank waits for the others before
/// its buffers and contexts go away.
pub fn run_ranks<T, F>(nranks: usize, nranks_per_node: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Rank) -> T + Sync,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let bootstraps = LocalBootstrap::create(nranks, nranks_per_node);
    thread::scope(|s| {
        let handles = bootstraps
            .into_iter()
            .map(|bootstrap| {
                let f = &f;
                thread::Builder::new()
                    .name(format!("rank-{}", bootstrap.rank()))
                    .spawn_scoped(s, move || {
                        let rank = bootstrap.rank();
                        let device = Arc::new(HostDevice::new((rank % nranks_per_node) as i32));
                        let comm = Communicator::builder(Arc::new(bootstrap))
                            .device(device.clone())
                            .host_hash((rank / nranks_per_node) as u64)
                            .build()
                            .unwrap();
                        let rank = Rank {
                            comm: Arc::new(comm),
                            device,
                        };
                        let result = f(&rank);
                        rank.comm.bootstrap().barrier().unwrap();
                        result
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}
