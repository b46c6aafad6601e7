//! Toy scheduling loop over `ExternMetadata`.
//!
//! Dispatches a synthetic instruction stream: device-capable ops lease a slab,
//! go to the batched backend, and return the slab when their batch has been
//! applied; everything else runs on the host path. The loop waits on the work
//! signal and a dispatch tick with `crossbeam::select!`.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crossbeam::channel::{self, select};
use device_arbiter::extern_meta::BackendSelection;
use device_arbiter::logging::{self, LogLevel, LoggingConfig};
use device_arbiter::{
    BatchConfig, BatchedCall, Device, DevicePtr, ExternConfig, ExternMetadata, Memory, PoolPolicy,
    WorkSignal,
};

/// Instruction mix of the synthetic program
const PROGRAM: &[&str] = &["gemm", "relu", "axpy", "gemv", "softmax", "dot", "gemm", "add"];

/// Idle ticks after the last dispatch before giving up on outstanding work
const DRAIN_IDLE_TICKS: u32 = 50;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    /// Read ARBITER_* from the environment
    Env,
    /// Host only
    None,
    /// Threaded batch backend
    Batched,
}

#[derive(Parser, Debug)]
#[command(name = "arbiter-sim", version)]
#[command(about = "Drive the device arbiter with a synthetic instruction stream", long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value_t = BackendArg::Env)]
    backend: BackendArg,

    /// Instructions to dispatch
    #[arg(short = 'n', long, default_value_t = 256)]
    instructions: usize,

    /// Calls per batch for the threaded backend
    #[arg(long)]
    batch_size: Option<usize>,

    /// Pool policy override (disabled, all, accelerators)
    #[arg(long)]
    pool_policy: Option<PoolPolicy>,

    /// Slab size leased per device call
    #[arg(long, default_value_t = 64 * 1024)]
    slab_size: usize,

    /// Number of accelerators to spread work over
    #[arg(long, default_value_t = 1)]
    devices: u32,

    /// Make every Nth device call fail
    #[arg(long)]
    fail_every: Option<usize>,

    /// Abort the run after this many instructions
    #[arg(long)]
    abort_after: Option<usize>,

    /// Dispatch tick in milliseconds
    #[arg(long, default_value_t = 1)]
    tick_ms: u64,

    /// Print final stats as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn build_config(cli: &Cli) -> anyhow::Result<ExternConfig> {
    let mut config = match cli.backend {
        BackendArg::Env => ExternConfig::from_env().context("reading ARBITER_* environment")?,
        BackendArg::None => ExternConfig::no_backend(),
        BackendArg::Batched => ExternConfig::batched(BatchConfig::default()),
    };
    if let Some(size) = cli.batch_size {
        if let BackendSelection::Batched(batch) = &mut config.backend {
            batch.max_batch_calls = size;
        }
    }
    if let Some(policy) = cli.pool_policy {
        config = config.with_pool_policy(policy);
    }
    config.validate()?;
    Ok(config)
}

/// Hands out fresh slab addresses when the pool misses.
struct SlabAllocator {
    next_addr: u64,
    allocated: usize,
}

impl SlabAllocator {
    fn alloc(&mut self, device: Device, size: usize) -> Memory {
        self.next_addr += size as u64;
        self.allocated += 1;
        Memory::new(device, DevicePtr(self.next_addr), size)
    }
}

#[derive(Debug, Default)]
struct SimCounters {
    device_calls: usize,
    host_ops: usize,
    failed_batches: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LoggingConfig::from_env().with_level(LogLevel::Debug)
    } else {
        LoggingConfig::from_env()
    };
    logging::init_with_config(&log_config)?;

    let config = build_config(&cli)?;
    let mut meta = ExternMetadata::new(config).context("starting extern metadata")?;
    let work = WorkSignal::or_never(meta.work_available().as_ref());
    let ticks = channel::tick(Duration::from_millis(cli.tick_ms.max(1)));
    let (done_tx, done_rx) = channel::unbounded::<(Device, Memory)>();

    let mut allocator = SlabAllocator {
        next_addr: 0x1000_0000,
        allocated: 0,
    };
    let mut counters = SimCounters::default();
    let mut dispatched = 0usize;
    let mut idle_ticks = 0u32;

    loop {
        select! {
            recv(work) -> _ => {
                idle_ticks = 0;
                if let Err(e) = meta.do_work() {
                    counters.failed_batches += 1;
                    tracing::warn!(error = %e, "continuing after failed batch");
                }
                for (device, mem) in done_rx.try_iter() {
                    let size = mem.size();
                    meta.put(device, mem, size);
                }
            }
            recv(ticks) -> _ => {
                if cli.abort_after.is_some_and(|n| dispatched >= n) {
                    meta.abort();
                    break;
                }
                if dispatched < cli.instructions {
                    dispatch(&cli, &mut meta, &mut allocator, &mut counters, &done_tx, dispatched)?;
                    dispatched += 1;
                    if dispatched == cli.instructions {
                        // push the last partial batch out
                        if meta.do_work().is_err() {
                            counters.failed_batches += 1;
                        }
                    }
                    continue;
                }
                if meta.stats().calls_outstanding() == 0 {
                    break;
                }
                idle_ticks += 1;
                if idle_ticks >= DRAIN_IDLE_TICKS {
                    tracing::info!("outstanding calls never completed, stopping");
                    break;
                }
            }
        }
    }

    meta.cleanup();
    let freed = meta.pool().drain().len();
    let stats = meta.stats();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("backend:        {}", stats.backend.as_deref().unwrap_or("none"));
        println!("instructions:   {}", dispatched);
        println!("device calls:   {}", counters.device_calls);
        println!("host ops:       {}", counters.host_ops);
        println!("batches:        {} applied, {} failed", stats.batches_applied, counters.failed_batches);
        println!("fresh slabs:    {}", allocator.allocated);
        println!("freed at end:   {}", freed);
        println!("{}", stats.pool);
        if stats.aborted {
            println!("run aborted");
        }
    }
    Ok(())
}

fn dispatch(
    cli: &Cli,
    meta: &mut ExternMetadata,
    allocator: &mut SlabAllocator,
    counters: &mut SimCounters,
    done_tx: &channel::Sender<(Device, Memory)>,
    index: usize,
) -> anyhow::Result<()> {
    let op = PROGRAM[index % PROGRAM.len()];
    if !meta.has_func(op) {
        counters.host_ops += 1;
        return Ok(());
    }

    let device = Device::Accelerator(index as u32 % cli.devices.max(1));
    let mem = match meta.get(device, cli.slab_size) {
        Ok(mem) => mem,
        Err(e) if e.is_not_available() => allocator.alloc(device, cli.slab_size),
        Err(e) => return Err(e.into()),
    };

    let fails = cli.fail_every.is_some_and(|n| n > 0 && index % n == 0);
    let done_tx = done_tx.clone();
    let call = BatchedCall::new(op, move || {
        if fails {
            Err(format!("injected failure at instruction {}", index))
        } else {
            Ok(())
        }
    })
    .on_complete(move || {
        // the scheduler owns the receiver for the whole run
        let _ = done_tx.send((device, mem));
    });

    match meta.submit(call) {
        Ok(()) => counters.device_calls += 1,
        Err(e) if e.is_not_available() => counters.host_ops += 1,
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
