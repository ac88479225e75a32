//! Risk-minimising dispatch.
//!
//! With a quantile-network artefact loaded, each worker gets a predicted
//! latency distribution; the policy minimises CVaR plus a log-barrier
//! deadline penalty. Without an artefact a closed-form risk score over
//! queue length, historical p99, capacity and the urgent end of the slack
//! histogram takes its place.

use super::artefact::QuantileNet;
use super::{build_state_vector, deadline_penalty, Decision, RequestMeta, WorkerView};
use crate::time::{now_ns, us_to_ns, Timestamp};

/// Quantile sample count per decision.
pub const NUM_TAUS: usize = 32;

/// CVaR tail fraction: score the worst 5% of the predicted distribution.
pub const DEFAULT_CVAR_ALPHA: f64 = 0.95;

/// Deterministic tail-weighted tau ladder: 80% of the samples spread over
/// (0, 0.8], the rest over (0.8, 1.0].
pub fn tau_ladder(k: usize) -> Vec<f64> {
    let body = (k as f64 * 0.8) as usize;
    let tail = k - body;
    let mut taus = Vec::with_capacity(k);
    for i in 0..body {
        taus.push(0.8 * (i + 1) as f64 / body as f64);
    }
    for j in 0..tail {
        taus.push(0.8 + 0.2 * (j + 1) as f64 / tail as f64);
    }
    taus
}

#[derive(Debug)]
pub struct RiskMin {
    model: Option<QuantileNet>,
    cvar_alpha: f64,
    taus: Vec<f64>,
    model_warned: bool,
}

impl RiskMin {
    pub fn new(model: Option<QuantileNet>) -> RiskMin {
        Self::with_alpha(model, DEFAULT_CVAR_ALPHA)
    }

    pub fn with_alpha(model: Option<QuantileNet>, cvar_alpha: f64) -> RiskMin {
        RiskMin {
            model,
            cvar_alpha,
            taus: tau_ladder(NUM_TAUS),
            model_warned: false,
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn schedule(
        &mut self,
        req: &RequestMeta,
        workers: &[WorkerView],
        now: Timestamp,
    ) -> Option<Decision> {
        let start = now_ns();
        if workers.is_empty() {
            return None;
        }

        let scored = match &self.model {
            Some(net) if net.matches(workers.len()) => self.score_model(req, workers, now),
            Some(_) => {
                if !self.model_warned {
                    log::warn!("risk-min artefact sized for a different rack; using heuristic");
                    self.model_warned = true;
                }
                self.score_heuristic(req, workers, now)
            }
            None => self.score_heuristic(req, workers, now),
        };

        let (target, min_risk) = scored?;
        Some(Decision {
            target,
            confidence: 1.0 / (1.0 + min_risk / 1e6),
            decision_ns: now_ns() - start,
        })
    }

    /// CVaR over the artefact's per-worker quantile estimates plus the
    /// deadline barrier. O(N * K).
    fn score_model(
        &self,
        req: &RequestMeta,
        workers: &[WorkerView],
        now: Timestamp,
    ) -> Option<(usize, f64)> {
        let net = self.model.as_ref()?;
        let state = build_state_vector(req, workers, now);
        let quantiles = net.forward(&state, &self.taus);
        let slack = req.deadline as i64 - now as i64;

        let mut best: Option<(usize, f64)> = None;
        for (idx, w) in workers.iter().enumerate() {
            if !w.healthy {
                continue;
            }
            let mut sorted = quantiles[idx].clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let var_idx = (self.cvar_alpha * sorted.len() as f64) as usize;
            let tail = &sorted[var_idx.min(sorted.len() - 1)..];
            let cvar = tail.iter().sum::<f64>() / tail.len() as f64;

            let risk = cvar + deadline_penalty(slack, cvar);
            if best.map_or(true, |(_, r)| risk < r) {
                best = Some((idx, risk));
            }
        }
        best
    }

    /// Closed-form fallback: queue pressure, historical tail, capacity
    /// discount and the urgent end of the slack histogram, then the same
    /// deadline barrier measured against the expected queue latency.
    fn score_heuristic(
        &self,
        req: &RequestMeta,
        workers: &[WorkerView],
        now: Timestamp,
    ) -> Option<(usize, f64)> {
        let slack = req.deadline as i64 - now as i64;
        let mut best: Option<(usize, f64)> = None;
        for (idx, w) in workers.iter().enumerate() {
            if !w.healthy {
                continue;
            }
            let urgent: u32 = w.slack_histogram[..4].iter().sum();
            let mut risk = 100.0 * w.queue_len as f64
                + w.p99_latency_ns as f64 / 1_000.0
                + 500.0 * urgent as f64;
            risk *= 2.0 - w.capacity_factor;

            let expected_ns =
                (w.avg_service_ns * (1.0 + w.queue_len as f64)).max(us_to_ns(1) as f64);
            risk += deadline_penalty(slack, expected_ns);

            if best.map_or(true, |(_, r)| risk < r) {
                best = Some((idx, risk));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ms_to_ns;
    use crate::wire::RequestType;

    fn req_with_deadline(deadline: u64) -> RequestMeta {
        RequestMeta {
            request_type: RequestType::Get,
            payload_size: 64,
            service_hint_us: 10,
            deadline,
        }
    }

    fn views(n: usize) -> Vec<WorkerView> {
        (0..n).map(|i| WorkerView::new(i as u8, 0)).collect()
    }

    #[test]
    fn tau_ladder_is_tail_weighted() {
        let taus = tau_ladder(NUM_TAUS);
        assert_eq!(taus.len(), NUM_TAUS);
        let body = taus.iter().filter(|&&t| t <= 0.8).count();
        assert_eq!(body, (NUM_TAUS as f64 * 0.8) as usize);
        assert!(taus.iter().all(|&t| t > 0.0 && t <= 1.0));
        // Strictly increasing within each segment.
        for pair in taus.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn heuristic_prefers_idle_fast_worker() {
        let mut policy = RiskMin::new(None);
        let now = crate::time::now_ns();
        let mut workers = views(3);
        workers[0].queue_len = 50;
        workers[0].p99_latency_ns = ms_to_ns(2);
        workers[1].capacity_factor = 0.2;
        workers[1].queue_len = 5;
        // worker 2 idle at full capacity
        let d = policy
            .schedule(&req_with_deadline(now + ms_to_ns(10)), &workers, now)
            .unwrap();
        assert_eq!(d.target, 2);
    }

    #[test]
    fn urgent_backlog_repels_traffic() {
        let mut policy = RiskMin::new(None);
        let now = crate::time::now_ns();
        let mut workers = views(2);
        workers[0].slack_histogram[1] = 20; // 20 tasks near their deadline
        let d = policy
            .schedule(&req_with_deadline(now + ms_to_ns(10)), &workers, now)
            .unwrap();
        assert_eq!(d.target, 1);
    }

    #[test]
    fn single_healthy_worker_takes_all_traffic() {
        let mut policy = RiskMin::new(None);
        let now = crate::time::now_ns();
        let mut workers = views(5);
        for (i, w) in workers.iter_mut().enumerate() {
            w.healthy = i == 4;
        }
        for _ in 0..50 {
            let d = policy
                .schedule(&req_with_deadline(now + ms_to_ns(10)), &workers, now)
                .unwrap();
            assert_eq!(d.target, 4);
        }
    }

    #[test]
    fn expired_deadline_still_yields_a_target() {
        // The barrier saturates rather than panicking; early drop happens
        // upstream at the LB.
        let mut policy = RiskMin::new(None);
        let now = crate::time::now_ns();
        let workers = views(2);
        let d = policy.schedule(&req_with_deadline(1), &workers, now);
        assert!(d.is_some());
    }

    #[test]
    fn model_path_scores_every_worker() {
        let net = QuantileNet::zeros(state_dim(2), 8, 4, 2);
        let mut policy = RiskMin::new(Some(net));
        let now = crate::time::now_ns();
        let workers = views(2);
        let d = policy
            .schedule(&req_with_deadline(now + ms_to_ns(10)), &workers, now)
            .unwrap();
        assert!(d.target < 2);
        assert!(d.confidence > 0.0 && d.confidence <= 1.0);
    }

    fn state_dim(n: usize) -> usize {
        super::super::state_vector_len(n)
    }
}
