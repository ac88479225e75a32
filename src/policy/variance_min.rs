//! Variance-minimising dispatch.
//!
//! Assign each request where it increases the sum of squared load
//! deviations the least. This equalises load across the rack, which under
//! heavy-tailed service times is precisely the trap: equal load does not
//! mean equal tail latency. Kept as the second baseline.

use super::artefact::ValueNet;
use super::{build_state_vector, Decision, RequestMeta, WorkerView};
use crate::time::{now_ns, Timestamp};

#[derive(Debug)]
pub struct VarianceMin {
    model: Option<ValueNet>,
    model_warned: bool,
}

impl VarianceMin {
    pub fn new(model: Option<ValueNet>) -> VarianceMin {
        VarianceMin {
            model,
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

        let target = match &self.model {
            Some(net) if net.matches(workers.len()) => {
                let state = build_state_vector(req, workers, now);
                let scores = net.forward(&state);
                let mut best: Option<(usize, f64)> = None;
                for (idx, w) in workers.iter().enumerate() {
                    if !w.healthy {
                        continue;
                    }
                    let score = scores[idx];
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((idx, score));
                    }
                }
                best.map(|(idx, _)| idx)
            }
            Some(_) => {
                if !self.model_warned {
                    log::warn!(
                        "variance-min artefact sized for a different rack; using heuristic"
                    );
                    self.model_warned = true;
                }
                self.heuristic(workers)
            }
            None => self.heuristic(workers),
        }?;

        let confidence = self.confidence(workers);
        Some(Decision {
            target,
            confidence,
            decision_ns: now_ns() - start,
        })
    }

    /// Argmin of the marginal change in sum-of-squared-deviations if the
    /// request landed on each healthy worker.
    fn heuristic(&self, workers: &[WorkerView]) -> Option<usize> {
        let n = workers.len() as f64;
        let mean = workers.iter().map(|w| w.load_ema).sum::<f64>() / n;

        let mut best: Option<(usize, f64)> = None;
        for (idx, w) in workers.iter().enumerate() {
            if !w.healthy {
                continue;
            }
            let old = w.load_ema;
            let new = old + 1.0;
            let delta = (new - mean) * (new - mean) - (old - mean) * (old - mean);
            // Strict < keeps the tie-break deterministic at the lowest index.
            if best.map_or(true, |(_, d)| delta < d) {
                best = Some((idx, delta));
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn confidence(&self, workers: &[WorkerView]) -> f64 {
        let n = workers.len() as f64;
        let mean = workers.iter().map(|w| w.load_ema).sum::<f64>() / n;
        let variance = workers
            .iter()
            .map(|w| (w.load_ema - mean) * (w.load_ema - mean))
            .sum::<f64>()
            / n;
        (-variance).exp()
    }
}
