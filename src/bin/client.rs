//! Client executable: paced heavy-tailed request stream with slot-table
//! deadline accounting.

use clap::Parser;
use slackline::config::ClientConfig;
use slackline::workload::{DeadlineRule, ServiceDistribution};
use slackline::Client;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "slackline-client", about = "Deadline-judging load generator", version)]
struct Cli {
    /// Client id (also selects the default port).
    #[arg(long, default_value = "0")]
    id: u8,
    /// Host part of the bind address.
    #[arg(long, default_value = "local")]
    host: String,
    /// Port to bind; defaults to 31870 + id.
    #[arg(long)]
    port: Option<u16>,
    /// Load balancer address (host:port).
    #[arg(long, required = true)]
    lb: String,
    /// Target request rate per second.
    #[arg(long, default_value = "10000")]
    rps: u64,
    /// Warmup seconds excluded from the measurement.
    #[arg(long, default_value = "5")]
    warmup: u64,
    /// Measured duration in seconds.
    #[arg(long, default_value = "30")]
    duration: u64,
    /// Seconds to wait for stragglers after the run.
    #[arg(long, default_value = "2")]
    grace: u64,
    /// Slot-pool size bounding in-flight requests.
    #[arg(long, default_value = "1024")]
    max_inflight: usize,
    /// Service-time distribution: pareto, lognormal, bimodal or uniform.
    #[arg(long, default_value = "pareto")]
    distribution: String,
    /// Pareto shape parameter.
    #[arg(long, default_value = "1.2")]
    alpha: f64,
    /// Minimum service time in microseconds (Pareto scale / uniform min).
    #[arg(long, default_value = "10")]
    min_service_us: u64,
    /// deadline = send_ts + hint * multiplier.
    #[arg(long, default_value = "5.0")]
    deadline_multiplier: f64,
    /// Fixed deadline window in microseconds; overrides the multiplier.
    #[arg(long)]
    fixed_deadline_us: Option<u64>,
    /// Workload RNG seed; 0 derives one from the client id.
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Directory for metric exports at shutdown.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, short)]
    verbose: bool,
}

fn parse_distribution(cli: &Cli) -> Result<ServiceDistribution, String> {
    match cli.distribution.to_ascii_lowercase().as_str() {
        "pareto" => Ok(ServiceDistribution::Pareto {
            alpha: cli.alpha,
            x_min_us: cli.min_service_us as f64,
        }),
        "lognormal" => Ok(ServiceDistribution::Lognormal {
            mu: (cli.min_service_us as f64).ln().max(0.0) + 1.0,
            sigma: 1.0,
        }),
        "bimodal" => Ok(ServiceDistribution::Bimodal {
            p_light: 0.9,
            light_mean_us: cli.min_service_us as f64,
            heavy_mean_us: cli.min_service_us as f64 * 100.0,
        }),
        "uniform" => Ok(ServiceDistribution::Uniform {
            min_us: cli.min_service_us as f64,
        }),
        other => Err(format!("unknown distribution: {other}")),
    }
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

    if cli.alpha <= 1.0 {
        eprintln!("--alpha must be > 1.0 (finite-mean Pareto)");
        return ExitCode::from(1);
    }
    if cli.min_service_us == 0 {
        eprintln!("--min-service-us must be at least 1");
        return ExitCode::from(1);
    }
    let distribution = match parse_distribution(&cli) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let port = cli.port.unwrap_or(31870 + cli.id as u16);
    let mut config = ClientConfig::new(cli.id, format!("{}:{}", cli.host, port), cli.lb.clone());
    config.target_rps = cli.rps;
    config.warmup_sec = cli.warmup;
    config.duration_sec = cli.duration;
    config.grace_sec = cli.grace;
    config.max_inflight = cli.max_inflight;
    config.seed = cli.seed;
    config.workload.distribution = distribution;
    config.workload.deadline = match cli.fixed_deadline_us {
        Some(us) => DeadlineRule::FixedWindowUs(us),
        None => DeadlineRule::Multiplier(cli.deadline_multiplier),
    };
    config.output_dir = cli.output_dir;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || stop_handler.store(true, Ordering::Relaxed)) {
        eprintln!("failed to install signal handler: {e}");
        return ExitCode::from(1);
    }

    let client = Client::new(config);
    match client.run(stop) {
        Ok(report) => {
            println!(
                "completed={} miss_rate={:.4}% p50={:.1}us p99={:.1}us p99.9={:.1}us rps={:.0}",
                report.completed,
                report.miss_rate * 100.0,
                report.p50_us,
                report.p99_us,
                report.p999_us,
                report.actual_rps,
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("client failed: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
