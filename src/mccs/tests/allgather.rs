mod common;

use mccs::plan::BufferType;
use mccs::{DataType, PacketType, Transport};

use common::{run_ranks, ALLGATHER_2X2};

const SIZE: usize = 1024;

#[test]
fn two_nodes_mix_sm_and_proxy_channels() {
    let results = run_ranks(4, 2, |rank| {
        let r = rank.rank();
        let local = r ^ 1;
        let remote = (r + 2) % 4;
        let plan = rank.plan(ALLGATHER_2X2);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(4 * SIZE);
        for _ in 0..2 {
            executor
                .execute(
                    r,
                    send.addr().get(),
                    recv.addr().get(),
                    SIZE,
                    4 * SIZE,
                    DataType::Float32,
                    &plan,
                    0,
                    PacketType::LL16,
                )
                .unwrap();
        }
        let stats = executor.stats();
        assert_eq!((stats.full_builds, stats.light_reloads), (1, 1));

        let key = executor.cached_keys().pop().unwrap();
        let context = executor.cached_context(&key).unwrap();
        let context = context.lock().unwrap();
        let connections = context.connections();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[&local].transport(), Transport::CudaIpc);
        let expected = Transport::ib(r % 2).unwrap();
        assert_eq!(connections[&remote].transport(), expected);

        assert_eq!(context.sm_channels().len(), 1);
        assert_eq!(context.proxy_channels().len(), 1);
        assert_eq!(context.num_semaphores(), 2);
        assert_eq!(context.proxy_service().num_semaphores(), 1);
        assert!(context.registered_memory(BufferType::Output, local).is_some());
        assert!(context.registered_memory(BufferType::Scratch, remote).is_some());
        assert_eq!(context.num_registered_memories(), 2);
        assert_eq!(context.scratch_buffer_size(), SIZE);
        assert_ne!(context.scratch_buffer_addr(), 0);
        assert_eq!(context.num_threads_per_block(), 512);

        let plans = context.device_execution_plans();
        assert_eq!(plans.len(), 2);
        assert_eq!((plans[0].n_sm_channels, plans[0].n_proxy_channels), (1, 0));
        assert_eq!((plans[1].n_sm_channels, plans[1].n_proxy_channels), (0, 1));
        assert_eq!(plans[0].n_operations, 3);
        assert_eq!(plans[1].n_operations, 3);

        // rank r writes its slot of the peer's output
        let put = plans[0].operations()[0];
        assert_eq!(put.output_offsets[0], (r * SIZE) as u64);
        let copy = plans[1].operations()[2];
        assert_eq!(copy.src_buffer_type, BufferType::Scratch);
        assert_eq!(copy.dst_offset, (remote * SIZE) as u64);
        assert_eq!(copy.size, SIZE as u64);

        let launches = rank.device.launches();
        let scratch = context.scratch_buffer_addr();
        assert!(launches.iter().all(|l| l.num_threadblocks == 2 && l.scratch == scratch));
        assert_eq!(launches.len(), 2);
    });
    assert_eq!(results.len(), 4);
}
