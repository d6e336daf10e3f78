mod common;

use crossbeam::utils::Backoff;
use rstest::rstest;

use mccs::gpu::DeviceBuffer;
use mccs::plan::{BufferType, OperationType};
use mccs::proxy::{Trigger, TriggerType};
use mccs::{DataType, ErrorCode, PacketType, Transport};

use common::{run_ranks, PROXY_PUT};

const SIZE: usize = 4096;
const CHUNK: usize = SIZE / 2;

#[test]
fn proxy_channels_move_data_between_nodes() {
    let results = run_ranks(2, 1, |rank| {
        let peer = 1 - rank.rank();
        let plan = rank.plan(PROXY_PUT);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = DeviceBuffer::from_slice(rank.comm.device(), &[rank.rank() as u8 + 10; SIZE]).unwrap();
        let recv = rank.buffer(SIZE);
        executor
            .execute(
                rank.rank(),
                send.addr().get(),
                recv.addr().get(),
                SIZE,
                SIZE,
                DataType::UInt32,
                &plan,
                0,
                PacketType::LL16,
            )
            .unwrap();

        let key = executor.cached_keys().pop().unwrap();
        let context = executor.cached_context(&key).unwrap();
        let context = context.lock().unwrap();
        assert_eq!(
            context.connections().get(&peer).unwrap().transport(),
            Transport::Ib0
        );
        assert!(context.sm_channels().is_empty());
        assert_eq!(context.proxy_channels().len(), 1);
        assert!(context.registered_memory(BufferType::Output, peer).is_some());

        let proxy = context.proxy_service();
        assert!(proxy.is_running());
        assert_eq!(proxy.num_semaphores(), 1);
        assert_eq!(proxy.num_memories(), 2);
        let channel = &context.proxy_channels()[0];
        let handle = channel.device_handle();
        assert_eq!(handle.proxy_channel.semaphore_id, 0);
        assert_eq!((handle.dst, handle.src), (0, 1));

        let op = context.device_execution_plans()[0].operations()[0];
        if rank.rank() == 0 {
            assert_eq!(op.op_type, OperationType::PutWithSignalAndFlush);
            assert_eq!(op.output_offsets[0], CHUNK as u64);
            assert_eq!(op.src_offset, CHUNK as u64);
            assert_eq!(op.size, CHUNK as u64);
        } else {
            assert_eq!(op.op_type, OperationType::Wait);
            assert_eq!(op.n_inputs, 1);
        }

        // stand in for the kernel: put the upper half and signal
        let trigger = Trigger::put(0, 0, CHUNK as u64, 1, CHUNK as u64, CHUNK as u64)
            .with(TriggerType::FLAG | TriggerType::SYNC);
        proxy.fifo().push(trigger).unwrap();
        let semaphore = proxy.semaphore(0).unwrap();
        let backoff = Backoff::new();
        while semaphore.inbound().unwrap() < 1 {
            backoff.snooze();
        }
        recv.read().unwrap()
    });
    for (rank, data) in results.into_iter().enumerate() {
        let peer = 1 - rank;
        assert!(data[..CHUNK].iter().all(|b| *b == 0));
        assert!(data[CHUNK..].iter().all(|b| *b == peer as u8 + 10));
    }
}

#[test]
fn proxy_failure_fails_the_next_call() {
    let results = run_ranks(2, 1, |rank| {
        let plan = rank.plan(PROXY_PUT);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        let run = || {
            executor.execute(
                rank.rank(),
                send.addr().get(),
                recv.addr().get(),
                SIZE,
                SIZE,
                DataType::UInt32,
                &plan,
                0,
                PacketType::LL16,
            )
        };
        run().unwrap();

        if rank.rank() == 0 {
            let key = executor.cached_keys().pop().unwrap();
            let context = executor.cached_context(&key).unwrap();
            let context = context.lock().unwrap();
            let proxy = context.proxy_service();
            // the proxy only knows memories 0 and 1
            proxy.fifo().push(Trigger::put(0, 5, 0, 1, 0, 8)).unwrap();
            let backoff = Backoff::new();
            while proxy.check().is_ok() {
                backoff.snooze();
            }
            drop(context);

            let err = run().unwrap_err();
            assert_eq!(err.code(), ErrorCode::ExecutorError);
            assert!(err.to_string().contains("Unknown proxy memory 5"));
            assert_eq!(executor.cached_contexts(), 0);
        } else {
            assert_eq!(executor.invalidate("proxy_put"), 1);
        }

        // both ranks rebuild together
        run().unwrap();
        (executor.stats(), rank.device.launches().len())
    });
    for (stats, launches) in results {
        assert_eq!(stats.full_builds, 2);
        assert_eq!(stats.launches, 2);
        assert_eq!(launches, 2);
    }
}

#[rstest]
#[case(PacketType::LL16)]
#[case(PacketType::LL8)]
fn packet_type_selects_the_kernel(#[case] packet_type: PacketType) {
    let launches = run_ranks(2, 1, |rank| {
        let plan = rank.plan(PROXY_PUT);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        executor
            .execute(
                rank.rank(),
                send.addr().get(),
                recv.addr().get(),
                SIZE,
                SIZE,
                DataType::BFloat16,
                &plan,
                0,
                packet_type,
            )
            .unwrap();
        rank.device.launches()
    });
    for (rank, launches) in launches.into_iter().enumerate() {
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].packet_type, packet_type);
        assert_eq!(launches[0].rank, rank);
        assert_eq!(launches[0].num_threadblocks, 1);
        assert_eq!(launches[0].data_type, DataType::BFloat16);
    }
}
