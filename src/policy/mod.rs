//! Dispatch policies and the LB-side worker state they read.
//!
//! The policy is a sum type over the three strategies; no dynamic dispatch
//! is involved and the LB owns exactly one instance per run. All three
//! implement the same operation: given a request and the current worker
//! views, pick a target and report how long the decision took.

pub mod artefact;
mod power_of_choices;
mod risk_min;
mod variance_min;

pub use power_of_choices::PowerOfChoices;
pub use risk_min::RiskMin;
pub use variance_min::VarianceMin;

use crate::time::Timestamp;
use crate::wire::{RequestType, SLACK_BINS};
use std::str::FromStr;

/// Default EMA smoothing for load updates.
pub const LOAD_EMA_ALPHA: f64 = 0.1;

/// Passive decay applied each state tick without an event.
pub const LOAD_EMA_DECAY: f64 = 0.99;

/// LB-side view of one worker, updated on dispatch, response and the
/// background state tick.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub worker_id: u8,
    pub queue_len: u32,
    pub load_ema: f64,
    pub avg_service_ns: f64,
    pub p99_latency_ns: u64,
    pub miss_rate: f64,
    pub capacity_factor: f64,
    pub healthy: bool,
    pub slack_histogram: [u32; SLACK_BINS],
    /// Last time a response or state update arrived from this worker.
    pub last_seen: Timestamp,
    /// Whether any dispatch/response event hit this view since the last
    /// state tick; the tick only decays idle views.
    pub saw_event: bool,
}

impl WorkerView {
    pub fn new(worker_id: u8, now: Timestamp) -> WorkerView {
        WorkerView {
            worker_id,
            queue_len: 0,
            load_ema: 0.0,
            avg_service_ns: 0.0,
            p99_latency_ns: 0,
            miss_rate: 0.0,
            capacity_factor: 1.0,
            healthy: true,
            slack_histogram: [0; SLACK_BINS],
            last_seen: now,
            saw_event: false,
        }
    }

    pub fn update_load_ema(&mut self, observed: f64) {
        self.load_ema = LOAD_EMA_ALPHA * observed + (1.0 - LOAD_EMA_ALPHA) * self.load_ema;
        self.saw_event = true;
    }

    pub fn note_dispatch(&mut self) {
        self.queue_len += 1;
        self.update_load_ema(self.queue_len as f64);
    }

    pub fn note_response(&mut self, service_ns: u64, now: Timestamp) {
        self.queue_len = self.queue_len.saturating_sub(1);
        self.update_load_ema(self.queue_len as f64);
        self.avg_service_ns = 0.9 * self.avg_service_ns + 0.1 * service_ns as f64;
        self.last_seen = now;
        self.healthy = true;
    }

    /// Background tick: decay the load of idle views and retire workers
    /// that have gone silent.
    pub fn tick(&mut self, now: Timestamp, unhealthy_timeout_ns: u64) {
        if !self.saw_event {
            self.load_ema *= LOAD_EMA_DECAY;
        }
        self.saw_event = false;
        if now.saturating_sub(self.last_seen) > unhealthy_timeout_ns {
            self.healthy = false;
        }
    }

    /// Fold in a state probe reply. `queue_len` stays the LB's own
    /// dispatch/response estimate; probes contribute the slack histogram
    /// and liveness.
    pub fn apply_state_update(&mut self, upd: &crate::wire::StateUpdate, now: Timestamp) {
        self.slack_histogram = upd.slack_histogram;
        self.last_seen = now;
        self.healthy = upd.healthy != 0;
        self.saw_event = true;
    }
}

/// Request features a policy may read.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta {
    pub request_type: RequestType,
    pub payload_size: u16,
    pub service_hint_us: u32,
    pub deadline: Timestamp,
}

/// Outcome of one scheduling decision.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub target: usize,
    pub confidence: f64,
    pub decision_ns: u64,
}

/// Strategy selected per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    PowerOfChoices,
    VarianceMin,
    RiskMin,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "po2" | "poc" | "power-of-2" | "power-of-choices" => Ok(PolicyKind::PowerOfChoices),
            "variance" | "variance-min" => Ok(PolicyKind::VarianceMin),
            "risk" | "risk-min" => Ok(PolicyKind::RiskMin),
            other => Err(format!("unknown policy: {other}")),
        }
    }
}

/// The pluggable dispatch policy.
#[derive(Debug)]
pub enum Policy {
    PowerOfChoices(PowerOfChoices),
    VarianceMin(VarianceMin),
    RiskMin(RiskMin),
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::PowerOfChoices(_) => "power-of-choices",
            Policy::VarianceMin(p) => {
                if p.has_model() {
                    "variance-min-model"
                } else {
                    "variance-min"
                }
            }
            Policy::RiskMin(p) => {
                if p.has_model() {
                    "risk-min-model"
                } else {
                    "risk-min"
                }
            }
        }
    }

    /// Choose a target worker, or `None` when no healthy worker exists.
    pub fn schedule(
        &mut self,
        req: &RequestMeta,
        workers: &[WorkerView],
        now: Timestamp,
    ) -> Option<Decision> {
        match self {
            Policy::PowerOfChoices(p) => p.schedule(req, workers, now),
            Policy::VarianceMin(p) => p.schedule(req, workers, now),
            Policy::RiskMin(p) => p.schedule(req, workers, now),
        }
    }

    /// Completion feedback. The shipped policies are trained offline, so
    /// this only keeps the door open for online variants.
    pub fn on_response(&mut self, _worker_id: u8, _e2e_ns: u64, _deadline_met: bool) {}
}

/// State vector fed to the model-backed policies: request features
/// followed by a fixed block per worker.
pub fn build_state_vector(req: &RequestMeta, workers: &[WorkerView], now: Timestamp) -> Vec<f64> {
    let mut state = Vec::with_capacity(4 + workers.len() * (7 + SLACK_BINS));
    state.push(req.request_type as u8 as f64);
    state.push(req.payload_size as f64 / 1000.0);
    state.push(req.service_hint_us as f64 / 100.0);
    let slack = req.deadline as i64 - now as i64;
    state.push(slack as f64 / 1e6);
    for w in workers {
        state.push(w.load_ema);
        state.push(w.queue_len as f64 / 100.0);
        state.push(w.capacity_factor);
        state.push(w.avg_service_ns / 1e6);
        state.push(w.p99_latency_ns as f64 / 1e6);
        state.push(w.miss_rate);
        state.push(if w.healthy { 1.0 } else { 0.0 });
        for bin in &w.slack_histogram {
            state.push(*bin as f64 / 100.0);
        }
    }
    state
}

/// Width of the state vector for `n` workers.
pub fn state_vector_len(n: usize) -> usize {
    4 + n * (7 + SLACK_BINS)
}

/// Log-barrier deadline penalty shared by the risk scorers. `scale_ns` is
/// the latency estimate the slack is measured against (CVaR for the model,
/// expected queue-latency for the heuristic).
pub(crate) fn deadline_penalty(slack_ns: i64, scale_ns: f64) -> f64 {
    if slack_ns <= 0 {
        return 1e9;
    }
    let ratio = slack_ns as f64 / (scale_ns + 1e-9);
    if ratio <= 1.0 {
        -1e6 * (ratio + 1e-9).ln()
    } else if ratio <= 2.0 {
        1e3 * (2.0 - ratio)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_kind_parses_aliases() {
        assert_eq!(
            PolicyKind::from_str("po2").unwrap(),
            PolicyKind::PowerOfChoices
        );
        assert_eq!(
            PolicyKind::from_str("variance-min").unwrap(),
            PolicyKind::VarianceMin
        );
        assert_eq!(
            PolicyKind::from_str("Risk-Min").unwrap(),
            PolicyKind::RiskMin
        );
        assert!(PolicyKind::from_str("random").is_err());
    }

    #[test]
    fn load_ema_blends_and_decays() {
        let mut view = WorkerView::new(0, 0);
        view.update_load_ema(10.0);
        assert!((view.load_ema - 1.0).abs() < 1e-9);
        // The tick right after an event clears the event mark; the next
        // idle tick decays passively.
        view.tick(0, u64::MAX);
        assert!((view.load_ema - 1.0).abs() < 1e-9);
        view.tick(0, u64::MAX);
        assert!((view.load_ema - 0.99).abs() < 1e-9);
    }

    #[test]
    fn tick_skips_decay_after_event() {
        let mut view = WorkerView::new(0, 0);
        view.update_load_ema(10.0);
        let before = view.load_ema;
        view.note_dispatch();
        view.tick(0, u64::MAX);
        // The dispatch marked an event, so this tick must not decay.
        assert!(view.load_ema >= before);
    }

    #[test]
    fn silent_worker_goes_unhealthy() {
        let mut view = WorkerView::new(0, 0);
        view.tick(2_000_000, 1_000_000);
        assert!(!view.healthy);
    }

    #[test]
    fn state_vector_layout_matches_len() {
        let req = RequestMeta {
            request_type: RequestType::Get,
            payload_size: 128,
            service_hint_us: 50,
            deadline: 1_000_000,
        };
        let workers: Vec<WorkerView> = (0..3).map(|i| WorkerView::new(i, 0)).collect();
        let state = build_state_vector(&req, &workers, 0);
        assert_eq!(state.len(), state_vector_len(3));
    }

    #[test]
    fn penalty_regions() {
        // Expired: hard wall.
        assert_eq!(deadline_penalty(0, 1000.0), 1e9);
        assert_eq!(deadline_penalty(-5, 1000.0), 1e9);
        // High risk: positive and growing as slack shrinks.
        let tight = deadline_penalty(100, 1000.0);
        let tighter = deadline_penalty(10, 1000.0);
        assert!(tighter > tight && tight > 0.0);
        // Caution band.
        let caution = deadline_penalty(1_500, 1000.0);
        assert!(caution > 0.0 && caution < 1e3);
        // Safe.
        assert_eq!(deadline_penalty(5_000, 1000.0), 0.0);
    }
}
