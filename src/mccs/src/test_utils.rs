use std::sync::Arc;
use std::thread;

use crate::bootstrap::{Bootstrap, LocalBootstrap};
use crate::communicator::Communicator;
use crate::gpu::HostDevice;

/// Runs `f` on one thread per rank, each with its own communicator. Ranks
/// of different nodes get different host hashes.
pub(crate) fn spawn_communicators<T, F>(nranks: usize, nranks_per_node: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Communicator) -> T + Sync,
{
    let bootstraps = LocalBootstrap::create(nranks, nranks_per_node);
    thread::scope(|s| {
        let handles = bootstraps
            .into_iter()
            .map(|bootstrap| {
                let f = &f;
                s.spawn(move || {
                    let rank = bootstrap.rank();
                    let comm = Communicator::builder(Arc::new(bootstrap))
                        .device(HostDevice::shared((rank % nranks_per_node) as i32))
                        .host_hash((rank / nranks_per_node) as u64)
                        .build()
                        .unwrap();
                    f(&comm)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}
