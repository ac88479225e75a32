//! In-process three-tier cluster used by the integration tests.
//!
//! Workers and the LB run on their own threads over the loopback
//! transport; the client runs on the caller's thread so tests get the
//! report back directly.
#![allow(dead_code)] // each test crate uses a subset of the harness

use slackline::config::{ClientConfig, LbConfig, WorkerConfig};
use slackline::policy::PolicyKind;
use slackline::queue::QueueKind;
use slackline::workload::{DeadlineRule, ServiceDistribution, WorkloadConfig};
use slackline::{Client, ClientReport, LoadBalancer, Worker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct ClusterSpec {
    /// Unique per test; URIs derive from it so parallel tests don't clash.
    pub tag: &'static str,
    pub policy: PolicyKind,
    pub queue: QueueKind,
    /// One entry per worker.
    pub capacities: Vec<f64>,
    pub compute_threads: usize,
    pub artificial_delay_ns: u64,
    pub worker_clock_skew_ns: i64,
}

impl ClusterSpec {
    pub fn new(tag: &'static str, policy: PolicyKind, capacities: Vec<f64>) -> ClusterSpec {
        ClusterSpec {
            tag,
            policy,
            queue: QueueKind::Fcfs,
            capacities,
            compute_threads: 1,
            artificial_delay_ns: 0,
            worker_clock_skew_ns: 0,
        }
    }
}

pub struct Cluster {
    stop: Arc<AtomicBool>,
    pub workers: Vec<Arc<Worker>>,
    pub lb: Arc<LoadBalancer>,
    lb_uri: String,
    client_uri: String,
    threads: Vec<JoinHandle<()>>,
}

pub fn launch(spec: ClusterSpec) -> Cluster {
    let stop = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();
    let mut worker_uris = Vec::new();
    let mut workers = Vec::new();

    for (i, &capacity) in spec.capacities.iter().enumerate() {
        let uri = format!("test://{}-w{}", spec.tag, i);
        worker_uris.push(uri.clone());
        let mut config = WorkerConfig::new(i as u8, uri);
        config.queue = spec.queue;
        config.compute_threads = spec.compute_threads;
        config.capacity_factor = capacity;
        config.artificial_delay_ns = spec.artificial_delay_ns;
        config.clock_skew_ns = spec.worker_clock_skew_ns;
        let worker = Arc::new(Worker::new(config));
        workers.push(worker.clone());
        let stop = stop.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("{}-w{}", spec.tag, i))
                .spawn(move || {
                    worker.run(stop).expect("worker run");
                })
                .unwrap(),
        );
    }

    let lb_uri = format!("test://{}-lb", spec.tag);
    let mut lb_config = LbConfig::new(lb_uri.clone(), worker_uris);
    lb_config.policy = spec.policy;
    let lb = Arc::new(LoadBalancer::new(lb_config));
    for (i, &capacity) in spec.capacities.iter().enumerate() {
        lb.set_capacity_factor(i, capacity);
    }
    {
        let lb = lb.clone();
        let stop = stop.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("{}-lb", spec.tag))
                .spawn(move || {
                    lb.run(stop).expect("lb run");
                })
                .unwrap(),
        );
    }

    Cluster {
        stop,
        workers,
        lb,
        lb_uri,
        client_uri: format!("test://{}-client", spec.tag),
        threads,
    }
}

impl Cluster {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(0, self.client_uri.clone(), self.lb_uri.clone())
    }

    /// Run a client to completion on the calling thread.
    pub fn run_client(&self, config: ClientConfig) -> ClientReport {
        Client::new(config).run(self.stop.clone()).expect("client run")
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for t in self.threads {
            let _ = t.join();
        }
        // Give dropped nexuses a beat to leave the registry.
        thread::sleep(Duration::from_millis(5));
    }
}

/// Light, uniform workload with roomy deadlines; misses should be rare.
pub fn easy_workload() -> WorkloadConfig {
    WorkloadConfig {
        distribution: ServiceDistribution::Uniform { min_us: 20.0 },
        deadline: DeadlineRule::Multiplier(100.0),
        p_get: 1.0,
        p_put: 0.0,
        p_scan: 0.0,
    }
}

/// Heavy-tailed workload with tight deadlines; the regime that separates
/// the policies.
pub fn heavy_tail_workload() -> WorkloadConfig {
    WorkloadConfig {
        distribution: ServiceDistribution::Pareto {
            alpha: 1.2,
            x_min_us: 10.0,
        },
        deadline: DeadlineRule::Multiplier(5.0),
        ..WorkloadConfig::default()
    }
}
