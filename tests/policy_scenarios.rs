//! Heterogeneous-rack scenarios: the probing baseline collapses, load
//! balancing alone doesn't fix the tail, risk-aware dispatch does.
//!
//! Scaled-down versions of the reference experiments: short runs, few
//! workers, relative assertions with wide margins so scheduler noise on a
//! shared test machine cannot flip them.

mod common;

use common::{heavy_tail_workload, launch, ClusterSpec};
use slackline::policy::PolicyKind;
use slackline::queue::QueueKind;
use slackline::ClientReport;

/// Two full-speed workers and two at a tenth of the speed. Anything routed
/// to a slow worker runs 10x the hint, while deadlines are 5x the hint:
/// a slow-worker dispatch is a guaranteed miss.
const HETERO: [f64; 4] = [1.0, 1.0, 0.1, 0.1];
const HOMOG: [f64; 4] = [1.0, 1.0, 1.0, 1.0];

fn run_scenario(
    tag: &'static str,
    policy: PolicyKind,
    queue: QueueKind,
    capacities: &[f64],
) -> (ClientReport, Vec<u64>) {
    let mut spec = ClusterSpec::new(tag, policy, capacities.to_vec());
    spec.queue = queue;
    let cluster = launch(spec);

    let mut config = cluster.client_config();
    config.target_rps = 3_000;
    config.warmup_sec = 1;
    config.duration_sec = 2;
    config.seed = 42;
    config.workload = heavy_tail_workload();
    let report = cluster.run_client(config);
    let dispatches = cluster.lb.dispatch_counts();
    cluster.shutdown();
    (report, dispatches)
}

#[test]
fn heterogeneity_separates_the_policies() {
    let (homog, _) = run_scenario(
        "sc-homog-po2",
        PolicyKind::PowerOfChoices,
        QueueKind::Fcfs,
        &HOMOG,
    );
    let (po2, po2_dispatch) = run_scenario(
        "sc-hetero-po2",
        PolicyKind::PowerOfChoices,
        QueueKind::Fcfs,
        &HETERO,
    );
    let (variance, var_dispatch) = run_scenario(
        "sc-hetero-var",
        PolicyKind::VarianceMin,
        QueueKind::Fcfs,
        &HETERO,
    );
    let (risk, risk_dispatch) = run_scenario(
        "sc-hetero-risk",
        PolicyKind::RiskMin,
        QueueKind::EdfHeap,
        &HETERO,
    );

    // Negative control: capacity-blind probing keeps feeding the slow
    // workers, and every one of those dispatches is a miss.
    let slow_share = slow_fraction(&po2_dispatch);
    assert!(
        slow_share > 0.10,
        "po2 sent only {slow_share:.3} of traffic to slow workers"
    );
    assert!(
        po2.miss_rate > homog.miss_rate + 0.05,
        "po2 hetero miss {} vs homog {}",
        po2.miss_rate,
        homog.miss_rate
    );
    assert!(
        po2.p99_us > homog.p99_us,
        "po2 hetero p99 {} vs homog {}",
        po2.p99_us,
        homog.p99_us
    );

    // The variance trap: loads get balanced (the slow workers still take a
    // hefty share) yet the tail stays far above the homogeneous baseline.
    assert!(
        slow_fraction(&var_dispatch) > 0.05,
        "variance-min dispatches {var_dispatch:?}"
    );
    assert!(variance.miss_rate > homog.miss_rate + 0.05);

    // Risk-aware dispatch: accepts imbalance, wins on misses.
    assert!(
        slow_fraction(&risk_dispatch) < slow_share,
        "risk-min slow share {:.3} not below po2 {:.3}",
        slow_fraction(&risk_dispatch),
        slow_share
    );
    assert!(
        risk.miss_rate < po2.miss_rate,
        "risk miss {} vs po2 {}",
        risk.miss_rate,
        po2.miss_rate
    );
    assert!(
        risk.miss_rate < variance.miss_rate,
        "risk miss {} vs variance {}",
        risk.miss_rate,
        variance.miss_rate
    );
}

fn slow_fraction(dispatches: &[u64]) -> f64 {
    let total: u64 = dispatches.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let slow: u64 = dispatches[2..].iter().sum();
    slow as f64 / total as f64
}
