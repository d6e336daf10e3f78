mod common;

use mccs::plan::{BufferType, OperationType};
use mccs::{DataType, PacketType, Transport};

use common::{run_ranks, SENDRECV_SM};

const SIZE: usize = 4096;

#[test]
fn sendrecv_builds_one_channel() {
    let results = run_ranks(2, 2, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        let stream = rank.comm.device().create_stream().unwrap();
        executor
            .execute(
                rank.rank(),
                send.addr().get(),
                recv.addr().get(),
                SIZE,
                SIZE,
                DataType::Float32,
                &plan,
                stream,
                PacketType::LL16,
            )
            .unwrap();
        let recv_addrs = rank.all_gather_addr(recv.addr().get());

        let key = executor.cached_keys().pop().unwrap();
        assert_eq!(key.send_buff, send.addr().get());
        assert_eq!(key.recv_buff, recv.addr().get());
        assert_eq!(key.plan, "sendrecv_sm");
        let context = executor.cached_context(&key).unwrap();
        let context = context.lock().unwrap();

        let conn = context.connections().get(&(1 - rank.rank())).unwrap();
        assert_eq!(conn.transport(), Transport::CudaIpc);
        assert_eq!(context.connections().len(), 1);
        // the receiving side builds the matching end of the handshake
        assert_eq!(context.num_semaphores(), 1);
        assert_eq!(context.scratch_buffer_addr(), 0);
        assert_eq!(context.scratch_buffer_size(), 0);
        assert!(context.proxy_channels().is_empty());

        if rank.rank() == 0 {
            assert_eq!(context.sm_channels().len(), 1);
            let handle = context.sm_channels()[0].device_handle().unwrap();
            assert_eq!(handle.dst as usize, recv_addrs[1]);
            assert_eq!(handle.src as usize, send.addr().get());
            assert!(context.registered_memory(BufferType::Output, 1).is_some());

            let plans = context.device_execution_plans();
            assert_eq!(plans.len(), 1);
            assert_eq!(plans[0].n_sm_channels, 1);
            assert_eq!(plans[0].n_proxy_channels, 0);
            assert_eq!(plans[0].n_operations, 1);
            let op = plans[0].operations()[0];
            assert_eq!(op.op_type, OperationType::Put);
            assert_eq!(op.n_outputs, 1);
            assert_eq!(op.size, SIZE as u64);
            assert_ne!(context.device_execution_plans_addr(), 0);
        } else {
            assert!(context.sm_channels().is_empty());
            assert!(context.device_execution_plans().is_empty());
            assert_eq!(context.num_registered_memories(), 0);
        }
        drop(context);

        let launches = rank.device.launches();
        assert_eq!(launches.len(), 1);
        let launch = &launches[0];
        assert_eq!(launch.rank, rank.rank());
        assert_eq!(launch.src, send.addr().get());
        assert_eq!(launch.dst, recv.addr().get());
        assert_eq!(launch.num_threads_per_block, 1024);
        assert_eq!(launch.packet_type, PacketType::LL16);
        assert_eq!(launch.data_type, DataType::Float32);
        assert_eq!(launch.flag, 1);
        launch.num_threadblocks
    });
    assert_eq!(results, vec![1, 0]);
}

#[test]
fn repeated_calls_reuse_the_context() {
    const ITERS: usize = 5;
    let results = run_ranks(2, 2, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        for _ in 0..ITERS {
            executor
                .execute(
                    rank.rank(),
                    send.addr().get(),
                    recv.addr().get(),
                    SIZE,
                    SIZE,
                    DataType::Int32,
                    &plan,
                    0,
                    PacketType::LL8,
                )
                .unwrap();
        }
        let flags: Vec<u32> = rank.device.launches().iter().map(|l| l.flag).collect();
        (executor.stats(), executor.cached_contexts(), flags)
    });
    for (stats, cached, flags) in results {
        assert_eq!(stats.full_builds, 1);
        assert_eq!(stats.light_reloads, ITERS - 1);
        assert_eq!(stats.launches, ITERS);
        assert_eq!(cached, 1);
        assert_eq!(flags, (1..=ITERS as u32).collect::<Vec<_>>());
    }
}

#[test]
fn interior_pointers_share_the_context() {
    let results = run_ranks(2, 2, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(2 * SIZE);
        let recv = rank.buffer(2 * SIZE);
        let base = send.addr().get();
        let mut observed = Vec::new();
        for (src_offset, size) in [(0usize, SIZE), (1024, SIZE), (512, SIZE / 2)] {
            executor
                .execute(
                    rank.rank(),
                    base + src_offset,
                    recv.addr().get() + 256,
                    size,
                    size,
                    DataType::Float16,
                    &plan,
                    0,
                    PacketType::LL16,
                )
                .unwrap();
            let key = executor.cached_keys().pop().unwrap();
            assert_eq!(key.send_buff, base);
            assert_eq!(key.send_buff_size, 2 * SIZE);
            let context = executor.cached_context(&key).unwrap();
            let context = context.lock().unwrap();
            if let Some(device_plan) = context.device_execution_plans().first() {
                let op = device_plan.operations()[0];
                observed.push((op.src_offset, op.dst_offset, op.output_offsets[0], op.size));
                // channel handles survive the light reload untouched
                assert_eq!(device_plan.sm_channels[0].src as usize, base);
            }
        }
        (executor.stats(), observed)
    });
    let (stats, observed) = &results[0];
    assert_eq!(stats.full_builds, 1);
    assert_eq!(stats.light_reloads, 2);
    assert_eq!(
        observed,
        &vec![
            (0, 256, 256, SIZE as u64),
            (1024, 256, 256, SIZE as u64),
            (512, 256, 256, SIZE as u64 / 2),
        ]
    );
    assert!(results[1].1.is_empty());
}

#[test]
fn different_buffers_build_new_contexts() {
    let results = run_ranks(2, 2, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone()).with_max_cached_contexts(Some(2));
        let buffers: Vec<_> = (0..3).map(|_| (rank.buffer(SIZE), rank.buffer(SIZE))).collect();
        let mut cached = Vec::new();
        for (send, recv) in &buffers {
            executor
                .execute(
                    rank.rank(),
                    send.addr().get(),
                    recv.addr().get(),
                    SIZE,
                    SIZE,
                    DataType::Float32,
                    &plan,
                    0,
                    PacketType::LL16,
                )
                .unwrap();
            cached.push(executor.cached_contexts());
        }
        (executor.stats().full_builds, cached)
    });
    for (builds, cached) in results {
        assert_eq!(builds, 3);
        // the third insert found the cache full and cleared it
        assert_eq!(cached, vec![1, 2, 1]);
    }
}

#[test]
fn invalidation_forces_a_rebuild() {
    let results = run_ranks(2, 2, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        let run = || {
            executor
                .execute(
                    rank.rank(),
                    send.addr().get(),
                    recv.addr().get(),
                    SIZE,
                    SIZE,
                    DataType::Float32,
                    &plan,
                    0,
                    PacketType::LL16,
                )
                .unwrap()
        };
        run();
        assert_eq!(executor.invalidate("allgather_2x2"), 0);
        assert_eq!(executor.invalidate("sendrecv_sm"), 1);
        assert_eq!(executor.cached_contexts(), 0);
        run();
        run();
        executor.clear_cache();
        assert_eq!(executor.cached_contexts(), 0);
        run();
        executor.stats()
    });
    for stats in results {
        assert_eq!(stats.full_builds, 3);
        assert_eq!(stats.light_reloads, 1);
        assert_eq!(stats.launches, 4);
    }
}

#[test]
fn unknown_buffer_is_rejected() {
    run_ranks(1, 1, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone());
        let recv = rank.buffer(SIZE);
        let err = executor
            .execute(
                0,
                0x10,
                recv.addr().get(),
                SIZE,
                SIZE,
                DataType::Float32,
                &plan,
                0,
                PacketType::LL16,
            )
            .unwrap_err();
        assert_eq!(executor.stats().launches, 0);
        assert!(rank.device.launches().is_empty());
        err.to_string()
    });
}

#[test]
fn equally_named_plan_reloads_a_cached_context() {
    let results = run_ranks(2, 2, |rank| {
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        // two parses of one plan: only the first is ever fully built
        for (plan, size) in [(rank.plan(SENDRECV_SM), SIZE), (rank.plan(SENDRECV_SM), SIZE / 4)] {
            executor
                .execute(
                    rank.rank(),
                    send.addr().get(),
                    recv.addr().get(),
                    size,
                    size,
                    DataType::Float32,
                    &plan,
                    0,
                    PacketType::LL16,
                )
                .unwrap();
        }
        let key = executor.cached_keys().pop().unwrap();
        let context = executor.cached_context(&key).unwrap();
        let context = context.lock().unwrap();
        let sizes: Vec<u64> = context
            .device_execution_plans()
            .iter()
            .map(|plan| plan.operations()[0].size)
            .collect();
        (executor.stats(), sizes)
    });
    for (stats, _) in &results {
        assert_eq!(stats.full_builds, 1);
        assert_eq!(stats.light_reloads, 1);
        assert_eq!(stats.launches, 2);
    }
    assert_eq!(results[0].1, vec![SIZE as u64 / 4]);
    assert!(results[1].1.is_empty());
}

#[test]
fn reloads_upload_on_the_launch_stream() {
    let results = run_ranks(2, 2, |rank| {
        let plan = rank.plan(SENDRECV_SM);
        let executor = mccs::Executor::new(rank.comm.clone());
        let send = rank.buffer(SIZE);
        let recv = rank.buffer(SIZE);
        let stream = rank.comm.device().create_stream().unwrap();
        for size in [SIZE, SIZE / 2, SIZE / 2] {
            executor
                .execute(
                    rank.rank(),
                    send.addr().get(),
                    recv.addr().get(),
                    size,
                    size,
                    DataType::Float32,
                    &plan,
                    stream,
                    PacketType::LL16,
                )
                .unwrap();
        }
        (stream, rank.device.stream_uploads(), rank.device.launches())
    });

    let (stream, uploads, launches) = &results[0];
    assert_eq!(uploads.len(), 3);
    assert_eq!(launches.len(), 3);
    for (upload, launch) in uploads.iter().zip(launches) {
        assert_eq!(upload.stream, *stream);
        assert_eq!(launch.stream, *stream);
        // the records are rewritten in place, behind earlier launches
        assert_eq!(upload.dst, launches[0].plans);
        assert_eq!(launch.plans, launches[0].plans);
    }

    let (_, uploads, launches) = &results[1];
    assert!(uploads.is_empty());
    assert!(launches.iter().all(|launch| launch.plans == 0));
}

#[test]
fn concurrent_builds_pair_up_across_ranks() {
    const THREADS: usize = 4;
    let results = run_ranks(2, 2, |rank| {
        let executor = mccs::Executor::new(rank.comm.clone());
        let buffers: Vec<_> = (0..THREADS)
            .map(|_| (rank.buffer(SIZE), rank.buffer(SIZE)))
            .collect();
        std::thread::scope(|s| {
            for (send, recv) in &buffers {
                let executor = &executor;
                s.spawn(move || {
                    let plan = rank.plan(SENDRECV_SM);
                    executor
                        .execute(
                            rank.rank(),
                            send.addr().get(),
                            recv.addr().get(),
                            SIZE,
                            SIZE,
                            DataType::Float32,
                            &plan,
                            0,
                            PacketType::LL16,
                        )
                        .unwrap();
                });
            }
        });
        let recv_bases: Vec<usize> = buffers.iter().map(|(_, recv)| recv.addr().get()).collect();
        let dsts: Vec<usize> = executor
            .cached_keys()
            .iter()
            .filter_map(|key| {
                let context = executor.cached_context(key)?;
                let context = context.lock().unwrap();
                let channel = context.sm_channels().first()?;
                Some(channel.device_handle().unwrap().dst as usize)
            })
            .collect();
        (executor.stats(), executor.cached_contexts(), recv_bases, dsts)
    });
    for (stats, cached, _, _) in &results {
        assert_eq!(stats.full_builds, THREADS);
        assert_eq!(*cached, THREADS);
    }
    // whatever order the threads ran in, every build on rank 0 met exactly
    // one build on rank 1
    let mut dsts = results[0].3.clone();
    let mut recv_bases = results[1].2.clone();
    dsts.sort_unstable();
    recv_bases.sort_unstable();
    assert_eq!(dsts, recv_bases);
    assert!(results[1].3.is_empty());
}
