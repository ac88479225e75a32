//! Worker executable: accepts dispatched requests, runs the local
//! scheduler and the compute pool, answers state probes.

use clap::Parser;
use slackline::config::WorkerConfig;
use slackline::queue::QueueKind;
use slackline::Worker;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "slackline-worker", about = "Deadline-aware service worker", version)]
struct Cli {
    /// Worker id within the rack (also selects the default port).
    #[arg(long, default_value = "0")]
    id: u8,
    /// Host part of the bind address.
    #[arg(long, default_value = "local")]
    host: String,
    /// Port to bind; defaults to 31850 + id.
    #[arg(long)]
    port: Option<u16>,
    /// Ready-queue variant: fcfs, edf-heap or edf-wheel.
    #[arg(long, default_value = "fcfs")]
    queue: QueueKind,
    /// Compute threads draining the ready queue.
    #[arg(long, default_value = "2")]
    compute_threads: usize,
    /// Relative processing power in (0, 1].
    #[arg(long, default_value = "1.0")]
    capacity: f64,
    /// Extra delay injected after each service, in nanoseconds.
    #[arg(long, default_value = "0")]
    artificial_delay_ns: u64,
    /// Clock skew applied to this node's timestamps, in nanoseconds.
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    clock_skew_ns: i64,
    /// Comma-separated cores to pin compute threads to.
    #[arg(long, value_delimiter = ',')]
    pin_cores: Vec<usize>,
    /// Directory for metric exports at shutdown.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.verbose {
        "debug"
    } else {
        "info"
    }))
    .init();

    if cli.capacity <= 0.0 || cli.capacity > 1.0 {
        eprintln!("--capacity must be in (0, 1]");
        return ExitCode::from(1);
    }

    let port = cli.port.unwrap_or(31850 + cli.id as u16);
    let mut config = WorkerConfig::new(cli.id, format!("{}:{}", cli.host, port));
    config.queue = cli.queue;
    config.compute_threads = cli.compute_threads.max(1);
    config.capacity_factor = cli.capacity;
    config.artificial_delay_ns = cli.artificial_delay_ns;
    config.clock_skew_ns = cli.clock_skew_ns;
    config.pin_cores = cli.pin_cores;
    config.output_dir = cli.output_dir;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || stop_handler.store(true, Ordering::Relaxed)) {
        eprintln!("failed to install signal handler: {e}");
        return ExitCode::from(1);
    }

    let worker = Worker::new(config);
    match worker.run(stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("worker failed: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
