//! Power-of-Choices probing.
//!
//! Sample `d` distinct workers uniformly and take the least loaded healthy
//! one. O(d) per decision and oblivious to the request, which is exactly
//! why it collapses on heterogeneous racks.

use super::{Decision, RequestMeta, WorkerView};
use crate::time::{now_ns, Timestamp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
pub struct PowerOfChoices {
    num_choices: usize,
    rng: StdRng,
}

impl PowerOfChoices {
    pub fn new(num_choices: usize, seed: u64) -> PowerOfChoices {
        PowerOfChoices {
            num_choices: num_choices.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw up to `d` distinct indices from `0..n`.
    fn sample_distinct(&mut self, n: usize) -> Vec<usize> {
        let d = self.num_choices.min(n);
        let mut picked = Vec::with_capacity(d);
        while picked.len() < d {
            let idx = self.rng.gen_range(0..n);
            if !picked.contains(&idx) {
                picked.push(idx);
            }
        }
        picked
    }

    pub fn schedule(
        &mut self,
        _req: &RequestMeta,
        workers: &[WorkerView],
        _now: Timestamp,
    ) -> Option<Decision> {
        let start = now_ns();
        if workers.is_empty() {
            return None;
        }

        let candidates = self.sample_distinct(workers.len());
        let mut best: Option<(usize, f64)> = None;
        for &idx in &candidates {
            let w = &workers[idx];
            if !w.healthy {
                continue;
            }
            match best {
                None => best = Some((idx, w.load_ema)),
                Some((best_idx, best_load)) => {
                    // Strictly lower load wins; ties go to the lower index.
                    if w.load_ema < best_load || (w.load_ema == best_load && idx < best_idx) {
                        best = Some((idx, w.load_ema));
                    }
                }
            }
        }

        // The probe can miss every healthy worker; fall back to a scan so a
        // rack with one survivor still gets all its traffic.
        if best.is_none() {
            for (idx, w) in workers.iter().enumerate() {
                if !w.healthy {
                    continue;
                }
                match best {
                    None => best = Some((idx, w.load_ema)),
                    Some((_, best_load)) if w.load_ema < best_load => {
                        best = Some((idx, w.load_ema));
                    }
                    _ => {}
                }
            }
        }

        best.map(|(target, load)| Decision {
            target,
            confidence: 1.0 - load,
            decision_ns: now_ns() - start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestType;

    fn req() -> RequestMeta {
        RequestMeta {
            request_type: RequestType::Get,
            payload_size: 64,
            service_hint_us: 10,
            deadline: u64::MAX,
        }
    }

    fn views(loads: &[f64]) -> Vec<WorkerView> {
        loads
            .iter()
            .enumerate()
            .map(|(i, &l)| {
                let mut v = WorkerView::new(i as u8, 0);
                v.load_ema = l;
                v
            })
            .collect()
    }

    #[test]
    fn selection_is_argmin_over_sampled_set() {
        // With d == n the sample is the full set, so the choice must be
        // the global argmin regardless of rng state.
        let mut policy = PowerOfChoices::new(4, 42);
        let workers = views(&[0.9, 0.1, 0.5, 0.7]);
        for _ in 0..50 {
            let d = policy.schedule(&req(), &workers, 0).unwrap();
            assert_eq!(d.target, 1);
        }
    }

    #[test]
    fn ties_break_to_lower_index() {
        let mut policy = PowerOfChoices::new(4, 7);
        let workers = views(&[0.5, 0.5, 0.5, 0.5]);
        for _ in 0..20 {
            assert_eq!(policy.schedule(&req(), &workers, 0).unwrap().target, 0);
        }
    }

    #[test]
    fn routes_everything_to_single_healthy_worker() {
        let mut policy = PowerOfChoices::new(2, 3);
        let mut workers = views(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        for (i, w) in workers.iter_mut().enumerate() {
            w.healthy = i == 3;
        }
        for _ in 0..200 {
            assert_eq!(policy.schedule(&req(), &workers, 0).unwrap().target, 3);
        }
    }

    #[test]
    fn no_healthy_worker_yields_none() {
        let mut policy = PowerOfChoices::new(2, 3);
        let mut workers = views(&[0.1, 0.2]);
        for w in &mut workers {
            w.healthy = false;
        }
        assert!(policy.schedule(&req(), &workers, 0).is_none());
    }

    #[test]
    fn confidence_reflects_load() {
        let mut policy = PowerOfChoices::new(2, 11);
        let workers = views(&[0.25, 0.25]);
        let d = policy.schedule(&req(), &workers, 0).unwrap();
        assert!((d.confidence - 0.75).abs() < 1e-9);
    }
}
