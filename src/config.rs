//! Per-component runtime configuration.
//!
//! The CLI layers in `src/bin/` fill these from flags; tests construct them
//! directly. Defaults follow the reference experiment setup.

use crate::policy::PolicyKind;
use crate::queue::QueueKind;
use crate::time::{ms_to_ns, us_to_ns};
use crate::workload::WorkloadConfig;
use std::path::PathBuf;

/// Default interval of the LB's background state tick (100 us).
pub const DEFAULT_STATE_UPDATE_INTERVAL_NS: u64 = us_to_ns(100);

/// A worker with no response or state update for this long is excluded
/// from selection.
pub const DEFAULT_UNHEALTHY_TIMEOUT_NS: u64 = ms_to_ns(1_000);

/// Pending entries older than this are failed back to the client.
pub const DEFAULT_PENDING_TIMEOUT_NS: u64 = ms_to_ns(2_000);

/// Completions the worker I/O loop drains per iteration.
pub const DEFAULT_COMPLETION_BATCH: usize = 32;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: u8,
    pub uri: String,
    pub queue: QueueKind,
    pub compute_threads: usize,
    /// Relative processing power in (0, 1]; the simulator divides target
    /// service times by this.
    pub capacity_factor: f64,
    /// Extra busy-wait injected after each service, modelling slow nodes.
    pub artificial_delay_ns: u64,
    /// Offset applied to every clock reading on this node. Experiments use
    /// it to prove worker clocks cannot influence the reported miss rate.
    pub clock_skew_ns: i64,
    pub completion_batch: usize,
    /// Cores to pin compute threads to, round-robin. Empty = unpinned.
    pub pin_cores: Vec<usize>,
    pub output_dir: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(worker_id: u8, uri: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            worker_id,
            uri: uri.into(),
            queue: QueueKind::Fcfs,
            compute_threads: 2,
            capacity_factor: 1.0,
            artificial_delay_ns: 0,
            clock_skew_ns: 0,
            completion_batch: DEFAULT_COMPLETION_BATCH,
            pin_cores: Vec::new(),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LbConfig {
    pub uri: String,
    pub worker_uris: Vec<String>,
    pub policy: PolicyKind,
    pub model_path: Option<PathBuf>,
    /// Fail hard (exit 3) instead of falling back to the heuristic when the
    /// artefact does not load.
    pub require_model: bool,
    pub policy_seed: u64,
    pub state_update_interval_ns: u64,
    pub unhealthy_timeout_ns: u64,
    pub pending_timeout_ns: u64,
    /// How many state ticks between slack-histogram polls of the workers.
    pub poll_every_ticks: u64,
    pub output_dir: Option<PathBuf>,
}

impl LbConfig {
    pub fn new(uri: impl Into<String>, worker_uris: Vec<String>) -> LbConfig {
        LbConfig {
            uri: uri.into(),
            worker_uris,
            policy: PolicyKind::PowerOfChoices,
            model_path: None,
            require_model: false,
            policy_seed: 0x5eed,
            state_update_interval_ns: DEFAULT_STATE_UPDATE_INTERVAL_NS,
            unhealthy_timeout_ns: DEFAULT_UNHEALTHY_TIMEOUT_NS,
            pending_timeout_ns: DEFAULT_PENDING_TIMEOUT_NS,
            poll_every_ticks: 10,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: u8,
    pub uri: String,
    pub lb_uri: String,
    pub target_rps: u64,
    pub warmup_sec: u64,
    pub duration_sec: u64,
    /// Window after the run in which straggler responses still free slots;
    /// slots busy past it count as misses.
    pub grace_sec: u64,
    /// Slot-pool size; bounds in-flight requests.
    pub max_inflight: usize,
    pub workload: WorkloadConfig,
    pub seed: u64,
    pub output_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(client_id: u8, uri: impl Into<String>, lb_uri: impl Into<String>) -> ClientConfig {
        ClientConfig {
            client_id,
            uri: uri.into(),
            lb_uri: lb_uri.into(),
            target_rps: 10_000,
            warmup_sec: 1,
            duration_sec: 10,
            grace_sec: 1,
            max_inflight: 1024,
            workload: WorkloadConfig::default(),
            seed: 0,
            output_dir: None,
        }
    }

    /// Per-client deterministic seed unless one was given explicitly.
    pub fn effective_seed(&self) -> u64 {
        if self.seed != 0 {
            self.seed
        } else {
            self.client_id as u64 * 1_000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults_are_sane() {
        let c = WorkerConfig::new(0, "test://w0");
        assert_eq!(c.queue, QueueKind::Fcfs);
        assert!(c.capacity_factor > 0.0 && c.capacity_factor <= 1.0);
        assert_eq!(c.completion_batch, 32);
    }

    #[test]
    fn client_seed_derives_from_id() {
        let mut c = ClientConfig::new(3, "test://c3", "test://lb");
        assert_eq!(c.effective_seed(), 3_000);
        c.seed = 42;
        assert_eq!(c.effective_seed(), 42);
    }
}
