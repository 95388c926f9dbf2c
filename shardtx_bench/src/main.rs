//! Shardtx transaction workload driver over the simulated cluster.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use futures::future::join_all;
use log::{self, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardtx::{
    logger_init, pf_error, pf_warn, CondFlags, ContainerHandle, ErrCode,
    ObjectId, ShardTxError, SimCluster, TxFlags, TxHandle, TxOp, ME,
};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of concurrent client workers.
    #[arg(short, long, default_value_t = 4)]
    clients: usize,

    /// Number of transactions issued by each worker.
    #[arg(short, long, default_value_t = 100)]
    txns: usize,

    /// Number of updates per transaction.
    #[arg(short, long, default_value_t = 4)]
    ops: usize,

    /// Size of every value in bytes.
    #[arg(short, long, default_value_t = 64)]
    value_size: usize,

    /// Number of simulated storage targets.
    #[arg(long, default_value_t = 16)]
    targets: u32,

    /// Number of objects the workload spreads over.
    #[arg(long, default_value_t = 8)]
    objects: u64,

    /// Number of replicas of every object.
    #[arg(long, default_value_t = 3)]
    replicas: u16,

    /// Probability that the simulated leader replies busy.
    #[arg(long, default_value_t = 0.0)]
    fault_rate: f64,

    /// Transaction config as a TOML string.
    #[arg(long, default_value_t = String::new())]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ShardTxError)` on any error.
    fn sanitize(&self) -> Result<(), ShardTxError> {
        if self.clients == 0 {
            Err(ShardTxError::msg("invalid number of clients 0"))
        } else if self.txns == 0 || self.ops == 0 {
            Err(ShardTxError::msg(format!(
                "invalid workload: txns {} ops {}",
                self.txns, self.ops
            )))
        } else if self.objects == 0 {
            Err(ShardTxError::msg("invalid number of objects 0"))
        } else if self.replicas == 0 || self.replicas as u32 > self.targets {
            Err(ShardTxError::msg(format!(
                "invalid replicas {} over {} targets",
                self.replicas, self.targets
            )))
        } else if !(0.0..1.0).contains(&self.fault_rate) {
            Err(ShardTxError::msg(format!(
                "invalid fault_rate {}",
                self.fault_rate
            )))
        } else if self.threads < 2 {
            Err(ShardTxError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Workload shape shared by every worker.
#[derive(Debug, Clone, Copy)]
struct Workload {
    txns: usize,
    ops: usize,
    value_size: usize,
    objects: u64,
}

/// Per-worker outcome counters.
#[derive(Debug, Default, Clone, Copy)]
struct WorkerStats {
    commits: u64,
    restarts: u64,
    resends: u64,
    failures: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.commits += other.commits;
        self.restarts += other.restarts;
        self.resends += other.resends;
        self.failures += other.failures;
    }
}

/// Runs one worker's transactions to completion, restarting those that
/// require it.
async fn run_worker(
    id: usize,
    cont: Arc<ContainerHandle>,
    load: Workload,
) -> Result<WorkerStats, ShardTxError> {
    let mut stats = WorkerStats::default();
    let mut rng = StdRng::from_entropy();

    for t in 0..load.txns {
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        for op in 0..load.ops {
            let oid = ObjectId::new(0, rng.gen_range(0..load.objects));
            let value = Bytes::from(vec![rng.gen::<u8>(); load.value_size]);
            tx.attach(TxOp::Update {
                oid,
                dkey: Bytes::from(format!("w{}-t{}-o{}", id, t, op)),
                iods: vec![(Bytes::from_static(b"val"), value)],
                cond: CondFlags::empty(),
            })
            .await?;
        }

        loop {
            match tx.commit().await {
                Ok(()) => {
                    stats.commits += 1;
                    stats.resends += tx.retry_count() as u64;
                    break;
                }
                Err(e) if e.errcode() == ErrCode::TxRestart => {
                    stats.restarts += 1;
                    tx.restart().await?;
                }
                Err(e) => {
                    pf_warn!("worker {} txn {} failed: {}", id, t, e);
                    stats.failures += 1;
                    break;
                }
            }
        }
        tx.close()?;
    }
    Ok(stats)
}

/// Actual main function of the workload driver.
fn bench_main() -> Result<(), ShardTxError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let _ = ME.set("bench".into());

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-bench")
            .build()?;

        runtime.block_on(async move {
            let sim = SimCluster::new(1, args.targets);
            sim.set_fault_rate(args.fault_rate);
            for i in 0..args.objects {
                sim.add_replicated(ObjectId::new(0, i), args.replicas, 1)?;
            }
            let config = if args.config.is_empty() {
                None
            } else {
                Some(args.config.as_str())
            };
            let cont = ContainerHandle::new(sim.pool_handle(), 1, config)?;

            let load = Workload {
                txns: args.txns,
                ops: args.ops,
                value_size: args.value_size,
                objects: args.objects,
            };
            let start = Instant::now();
            let workers = (0..args.clients).map(|id| {
                tokio::spawn(run_worker(id, cont.clone(), load))
            });
            let results = join_all(workers).await;
            let elapsed = start.elapsed();

            let mut total = WorkerStats::default();
            for res in results {
                total.merge(&res??);
            }
            let bulks = sim.bulk_stats();
            println!(
                "commits {} restarts {} resends {} failures {}",
                total.commits, total.restarts, total.resends, total.failures
            );
            println!(
                "rpcs {} bulks registered {} outstanding {}",
                sim.sent_count(),
                bulks.registered,
                bulks.outstanding
            );
            println!(
                "elapsed {:.3} s, throughput {:.1} txn/s",
                elapsed.as_secs_f64(),
                total.commits as f64 / elapsed.as_secs_f64().max(1e-9)
            );

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ShardTxError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the workload driver.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = bench_main() {
        pf_error!("bench_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
