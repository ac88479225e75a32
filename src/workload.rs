//! Heavy-tailed workload generation.
//!
//! Service-time samples come from one of four distributions; Pareto with a
//! shape below 2 has infinite variance, which is the regime that separates
//! the dispatch policies. Deadlines are derived from the service hint and a
//! multiplier (or an explicit fixed window) at send time, so the hint and
//! the deadline stay independent inputs downstream.

use crate::time::{us_to_ns, Timestamp};
use crate::wire::RequestType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as _, LogNormal, Normal, Pareto};

/// Which service-time distribution the generator draws from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServiceDistribution {
    /// Pareto with shape `alpha` and scale `x_min_us`. Alpha in 1.1..1.5 is
    /// the heavy-tail regime.
    Pareto { alpha: f64, x_min_us: f64 },
    /// Lognormal over microseconds.
    Lognormal { mu: f64, sigma: f64 },
    /// Mixture of a light and a heavy normal mode.
    Bimodal {
        p_light: f64,
        light_mean_us: f64,
        heavy_mean_us: f64,
    },
    /// Uniform on [min, 2*min].
    Uniform { min_us: f64 },
}

impl ServiceDistribution {
    /// Theoretical Pareto mean in microseconds; infinite for alpha <= 1.
    pub fn pareto_mean(alpha: f64, x_min_us: f64) -> f64 {
        if alpha <= 1.0 {
            f64::INFINITY
        } else {
            alpha * x_min_us / (alpha - 1.0)
        }
    }

    /// Theoretical Pareto variance; infinite for alpha <= 2. This going
    /// infinite while the mean stays finite is what defeats
    /// variance-balancing dispatch.
    pub fn pareto_variance(alpha: f64, x_min_us: f64) -> f64 {
        if alpha <= 2.0 {
            f64::INFINITY
        } else {
            x_min_us * x_min_us * alpha / ((alpha - 1.0) * (alpha - 1.0) * (alpha - 2.0))
        }
    }
}

/// Deadline assignment mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeadlineRule {
    /// deadline = send_ts + service_hint * multiplier.
    Multiplier(f64),
    /// deadline = send_ts + fixed window.
    FixedWindowUs(u64),
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub distribution: ServiceDistribution,
    pub deadline: DeadlineRule,
    /// Request-type mix: probabilities of Get and Put and Scan; the
    /// remainder is Compute.
    pub p_get: f64,
    pub p_put: f64,
    pub p_scan: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            distribution: ServiceDistribution::Pareto {
                alpha: 1.2,
                x_min_us: 10.0,
            },
            deadline: DeadlineRule::Multiplier(5.0),
            p_get: 0.7,
            p_put: 0.2,
            p_scan: 0.05,
        }
    }
}

/// One generated request, before it is stamped with a send timestamp.
#[derive(Debug, Clone, Copy)]
pub struct RequestDraw {
    pub request_type: RequestType,
    pub service_hint_us: u32,
    pub payload_size: u16,
}

enum Sampler {
    Pareto(Pareto<f64>),
    Lognormal(LogNormal<f64>),
    Bimodal {
        p_light: f64,
        light: Normal<f64>,
        heavy: Normal<f64>,
    },
    Uniform {
        min_us: f64,
    },
}

/// Seedable request generator; one per client thread.
pub struct RequestGenerator {
    config: WorkloadConfig,
    sampler: Sampler,
    rng: StdRng,
}

impl RequestGenerator {
    pub fn new(config: WorkloadConfig, seed: u64) -> RequestGenerator {
        let sampler = match config.distribution {
            ServiceDistribution::Pareto { alpha, x_min_us } => {
                Sampler::Pareto(Pareto::new(x_min_us, alpha).expect("pareto parameters"))
            }
            ServiceDistribution::Lognormal { mu, sigma } => {
                Sampler::Lognormal(LogNormal::new(mu, sigma).expect("lognormal parameters"))
            }
            ServiceDistribution::Bimodal {
                p_light,
                light_mean_us,
                heavy_mean_us,
            } => Sampler::Bimodal {
                p_light,
                light: Normal::new(light_mean_us, light_mean_us * 0.1).expect("light mode"),
                heavy: Normal::new(heavy_mean_us, heavy_mean_us * 0.2).expect("heavy mode"),
            },
            ServiceDistribution::Uniform { min_us } => Sampler::Uniform { min_us },
        };
        RequestGenerator {
            config,
            sampler,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw one service-time sample in microseconds.
    pub fn sample_service_us(&mut self) -> f64 {
        match &self.sampler {
            Sampler::Pareto(d) => d.sample(&mut self.rng),
            Sampler::Lognormal(d) => d.sample(&mut self.rng),
            Sampler::Bimodal {
                p_light,
                light,
                heavy,
            } => {
                if self.rng.gen::<f64>() < *p_light {
                    light.sample(&mut self.rng).max(1.0)
                } else {
                    heavy.sample(&mut self.rng).max(1.0)
                }
            }
            Sampler::Uniform { min_us } => min_us * (1.0 + self.rng.gen::<f64>()),
        }
    }

    /// Draw the next request: type, service hint and payload size.
    pub fn generate(&mut self) -> RequestDraw {
        let r = self.rng.gen::<f64>();
        let request_type = if r < self.config.p_get {
            RequestType::Get
        } else if r < self.config.p_get + self.config.p_put {
            RequestType::Put
        } else if r < self.config.p_get + self.config.p_put + self.config.p_scan {
            RequestType::Scan
        } else {
            RequestType::Compute
        };

        let service_us = self.sample_service_us().max(1.0);
        let payload_size = 64 + self.rng.gen_range(0..256u16);

        RequestDraw {
            request_type,
            service_hint_us: service_us.min(u32::MAX as f64) as u32,
            payload_size,
        }
    }

    /// Absolute deadline for a request sent at `send_ts`.
    pub fn deadline_for(&self, send_ts: Timestamp, draw: &RequestDraw) -> Timestamp {
        match self.config.deadline {
            DeadlineRule::Multiplier(m) => {
                send_ts + us_to_ns((draw.service_hint_us as f64 * m) as u64)
            }
            DeadlineRule::FixedWindowUs(us) => send_ts + us_to_ns(us),
        }
    }
}
