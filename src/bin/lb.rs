//! Load-balancer executable: accepts client requests, dispatches per the
//! selected policy, relays worker responses.

use clap::Parser;
use slackline::config::LbConfig;
use slackline::policy::PolicyKind;
use slackline::LoadBalancer;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "slackline-lb", about = "Risk-aware request dispatcher", version)]
struct Cli {
    /// Host part of the bind address.
    #[arg(long, default_value = "local")]
    host: String,
    /// Port to bind.
    #[arg(long, default_value = "31860")]
    port: u16,
    /// Worker addresses, comma separated (host:port).
    #[arg(long, value_delimiter = ',', required = true)]
    workers: Vec<String>,
    /// Dispatch policy: po2, variance-min or risk-min.
    #[arg(long, default_value = "po2")]
    policy: PolicyKind,
    /// Policy artefact (JSON weights) for the model-backed policies.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Treat an artefact load failure as fatal instead of falling back.
    #[arg(long)]
    require_model: bool,
    /// Per-worker capacity factors, comma separated, aligned with
    /// --workers. Unlisted workers default to 1.0.
    #[arg(long, value_delimiter = ',')]
    capacities: Vec<f64>,
    /// Background state tick interval in microseconds.
    #[arg(long, default_value = "100")]
    state_update_interval_us: u64,
    /// Mark a worker unhealthy after this long without a response (ms).
    #[arg(long, default_value = "1000")]
    unhealthy_timeout_ms: u64,
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

    if cli.workers.is_empty() {
        eprintln!("at least one worker address is required");
        return ExitCode::from(1);
    }

    let mut config = LbConfig::new(format!("{}:{}", cli.host, cli.port), cli.workers);
    config.policy = cli.policy;
    config.model_path = cli.model;
    config.require_model = cli.require_model;
    config.state_update_interval_ns = cli.state_update_interval_us * 1_000;
    config.unhealthy_timeout_ns = cli.unhealthy_timeout_ms * 1_000_000;
    config.output_dir = cli.output_dir;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || stop_handler.store(true, Ordering::Relaxed)) {
        eprintln!("failed to install signal handler: {e}");
        return ExitCode::from(1);
    }

    let lb = LoadBalancer::new(config);
    for (i, capacity) in cli.capacities.iter().enumerate() {
        lb.set_capacity_factor(i, *capacity);
    }
    match lb.run(stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lb failed: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
