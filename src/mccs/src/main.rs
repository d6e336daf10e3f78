use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal;

use anyhow::{anyhow, Result};
use structopt::StructOpt;

use mccs::bootstrap::{Bootstrap, LocalBootstrap};
use mccs::config::Config;
use mccs::gpu::{DeviceBuffer, HostDevice};
use mccs::{Communicator, DataType, ExecutionPlan, Executor, PacketType};

use chrono::Timelike;
use env_logger::fmt::Color;
use std::io::Write;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "mccs-exec", about = "Runs an execution plan on in-process ranks")]
struct Opts {
    /// Config path
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Execution plan (JSON)
    #[structopt(short, long)]
    plan: PathBuf,
    #[structopt(short, long, default_value = "2")]
    nranks: usize,
    #[structopt(long)]
    nranks_per_node: Option<usize>,
    /// Input message size in bytes
    #[structopt(short, long, default_value = "4096")]
    size: usize,
    /// Output message size in bytes, defaults to the input size
    #[structopt(long)]
    recv_size: Option<usize>,
    #[structopt(short, long, default_value = "1")]
    iters: usize,
    #[structopt(long)]
    packet_type: Option<PacketType>,
    #[structopt(long, default_value = "float32")]
    data_type: DataType,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn run_rank(
    bootstrap: LocalBootstrap,
    opts: &Opts,
    config: &Config,
    hca_devices: &[String],
) -> Result<()> {
    let rank = bootstrap.rank();
    let nranks_per_node = bootstrap.num_ranks_per_node();
    let device = Arc::new(HostDevice::new((rank % nranks_per_node) as i32));
    let comm = Communicator::builder(Arc::new(bootstrap))
        .device(device.clone())
        .hca_devices(hca_devices.to_vec())
        .host_hash((rank / nranks_per_node) as u64)
        .build()?;
    let comm = Arc::new(comm);
    let plan = ExecutionPlan::from_path(&opts.plan)?;
    let executor = Executor::new(Arc::clone(&comm))
        .with_max_cached_contexts(config.executor.max_cached_contexts);

    let recv_size = opts.recv_size.unwrap_or(opts.size);
    let send = DeviceBuffer::from_slice(comm.device(), &vec![rank as u8; opts.size])?;
    let recv = DeviceBuffer::zeroed(comm.device(), recv_size)?;
    let stream = comm.device().create_stream()?;
    let packet_type = opts
        .packet_type
        .unwrap_or(config.executor.default_packet_type);

    for iter in 0..opts.iters {
        if TERMINATE.load(Ordering::Relaxed) {
            log::info!("Rank {} interrupted after {} iterations", rank, iter);
            break;
        }
        executor.execute(
            rank,
            send.addr().get(),
            recv.addr().get(),
            opts.size,
            recv_size,
            opts.data_type,
            &plan,
            stream,
            packet_type,
        )?;
        comm.bootstrap().barrier()?;
    }
    comm.device().stream_synchronize(stream)?;
    comm.device().destroy_stream(stream)?;

    let stats = executor.stats();
    log::info!(
        "Rank {}: {} launches, {} full builds, {} light reloads, {} kernel launches recorded",
        rank,
        stats.launches,
        stats.full_builds,
        stats.light_reloads,
        device.launches().len()
    );
    // peers may still read our buffers until everyone is done
    comm.bootstrap().barrier()?;
    Ok(())
}

fn main() -> Result<()> {
    better_panic::install();
    let opts = Opts::from_args();
    let config = match &opts.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            let style = buf
                .style()
                .set_color(Color::Black)
                .set_intense(true)
                .clone();
            let time = format!(
                "{:02}:{:02}:{:02}.{:03}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis()
            );
            writeln!(
                buf,
                "{}{} {} {}{} {}",
                style.value("["),
                time,
                buf.default_styled_level(record.level()),
                record.module_path().unwrap_or(""),
                style.value("]"),
                record.args()
            )
        })
        .init();

    // process Ctrl-C event
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }?;

    let nranks_per_node = opts
        .nranks_per_node
        .or(config.topology.nranks_per_node)
        .unwrap_or(opts.nranks);
    if nranks_per_node == 0 || opts.nranks % nranks_per_node != 0 {
        return Err(anyhow!(
            "{} ranks cannot be split into nodes of {}",
            opts.nranks,
            nranks_per_node
        ));
    }
    let hca_devices = config.fabric.resolved_hca_devices()?;
    log::info!(
        "Running plan {} on {} ranks, {} per node",
        opts.plan.display(),
        opts.nranks,
        nranks_per_node
    );

    let bootstraps = LocalBootstrap::create(opts.nranks, nranks_per_node);
    let results: Vec<Result<()>> = std::thread::scope(|s| {
        let handles: Vec<_> = bootstraps
            .into_iter()
            .map(|bootstrap| {
                let (opts, config, hca_devices) = (&opts, &config, &hca_devices);
                std::thread::Builder::new()
                    .name(format!("rank-{}", bootstrap.rank()))
                    .spawn_scoped(s, move || run_rank(bootstrap, opts, config, hca_devices))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("rank thread panicked"))),
                Err(e) => Err(e.into()),
            })
            .collect()
    });
    for result in results {
        result?;
    }
    log::info!("Done");
    Ok(())
}
