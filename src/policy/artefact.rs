//! Serialised policy artefacts.
//!
//! Models are trained offline and shipped as JSON weight dumps. Two shapes
//! exist: a value network scoring each worker (variance-min model mode)
//! and a quantile network estimating per-worker latency quantiles from a
//! cosine tau embedding (risk-min model mode). A missing or malformed
//! artefact is never fatal here; callers decide whether to fall back.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// `w` is rows x len(x); returns `w x + b` with optional ReLU applied.
fn matvec(w: &[Vec<f64>], x: &[f64], b: &[f64], activate: bool) -> Vec<f64> {
    w.iter()
        .zip(b)
        .map(|(row, bias)| {
            let sum: f64 = row.iter().zip(x).map(|(wi, xi)| wi * xi).sum::<f64>() + bias;
            if activate {
                relu(sum)
            } else {
                sum
            }
        })
        .collect()
}

fn check_matrix(name: &str, m: &[Vec<f64>], rows: usize, cols: usize) -> Result<()> {
    if m.len() != rows || m.iter().any(|row| row.len() != cols) {
        return Err(Error::Artefact {
            path: Path::new(name).to_path_buf(),
            reason: format!("{name}: expected {rows}x{cols} weights"),
        });
    }
    Ok(())
}

/// Per-worker scoring network: two dense layers, scores are argmax'd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueNet {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_workers: usize,
    pub w1: Vec<Vec<f64>>,
    pub b1: Vec<f64>,
    pub w2: Vec<Vec<f64>>,
    pub b2: Vec<f64>,
}

impl ValueNet {
    /// Zero-weight network of the right shape; handy for tests.
    pub fn zeros(num_workers: usize, hidden_dim: usize) -> ValueNet {
        let input_dim = super::state_vector_len(num_workers);
        ValueNet {
            input_dim,
            hidden_dim,
            num_workers,
            w1: vec![vec![0.0; input_dim]; hidden_dim],
            b1: vec![0.0; hidden_dim],
            w2: vec![vec![0.0; hidden_dim]; num_workers],
            b2: vec![0.0; num_workers],
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_matrix("w1", &self.w1, self.hidden_dim, self.input_dim)?;
        check_matrix("w2", &self.w2, self.num_workers, self.hidden_dim)?;
        if self.b1.len() != self.hidden_dim || self.b2.len() != self.num_workers {
            return Err(Error::Artefact {
                path: Path::new("value-net").to_path_buf(),
                reason: "bias length mismatch".into(),
            });
        }
        Ok(())
    }

    /// Whether this artefact was trained for a rack of `n` workers.
    pub fn matches(&self, n: usize) -> bool {
        self.num_workers == n && self.input_dim == super::state_vector_len(n)
    }

    /// One score per worker.
    pub fn forward(&self, state: &[f64]) -> Vec<f64> {
        let padded = pad_state(state, self.input_dim);
        let hidden = matvec(&self.w1, &padded, &self.b1, true);
        matvec(&self.w2, &hidden, &self.b2, false)
    }
}

/// Implicit-quantile-style network: a state trunk and a cosine tau
/// embedding combined multiplicatively, with one output head per worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantileNet {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub embedding_dim: usize,
    pub num_workers: usize,
    pub state_w: Vec<Vec<f64>>,
    pub state_b: Vec<f64>,
    pub tau_w: Vec<Vec<f64>>,
    pub tau_b: Vec<f64>,
    pub head_w: Vec<Vec<f64>>,
    pub head_b: Vec<f64>,
}

impl QuantileNet {
    pub fn zeros(
        input_dim: usize,
        hidden_dim: usize,
        embedding_dim: usize,
        num_workers: usize,
    ) -> QuantileNet {
        QuantileNet {
            input_dim,
            hidden_dim,
            embedding_dim,
            num_workers,
            state_w: vec![vec![0.0; input_dim]; hidden_dim],
            state_b: vec![0.0; hidden_dim],
            tau_w: vec![vec![0.0; embedding_dim]; hidden_dim],
            tau_b: vec![0.0; hidden_dim],
            head_w: vec![vec![0.0; hidden_dim]; num_workers],
            head_b: vec![0.0; num_workers],
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_matrix("state_w", &self.state_w, self.hidden_dim, self.input_dim)?;
        check_matrix("tau_w", &self.tau_w, self.hidden_dim, self.embedding_dim)?;
        check_matrix("head_w", &self.head_w, self.num_workers, self.hidden_dim)?;
        if self.state_b.len() != self.hidden_dim
            || self.tau_b.len() != self.hidden_dim
            || self.head_b.len() != self.num_workers
        {
            return Err(Error::Artefact {
                path: Path::new("quantile-net").to_path_buf(),
                reason: "bias length mismatch".into(),
            });
        }
        Ok(())
    }

    pub fn matches(&self, n: usize) -> bool {
        self.num_workers == n && self.input_dim == super::state_vector_len(n)
    }

    /// Latency-quantile estimates, indexed `[worker][tau]`.
    pub fn forward(&self, state: &[f64], taus: &[f64]) -> Vec<Vec<f64>> {
        let padded = pad_state(state, self.input_dim);
        let h_state = matvec(&self.state_w, &padded, &self.state_b, true);

        let mut out = vec![Vec::with_capacity(taus.len()); self.num_workers];
        for &tau in taus {
            let phi: Vec<f64> = (0..self.embedding_dim)
                .map(|j| (PI * j as f64 * tau).cos())
                .collect();
            let h_tau = matvec(&self.tau_w, &phi, &self.tau_b, true);
            let h: Vec<f64> = h_state.iter().zip(&h_tau).map(|(a, b)| a * b).collect();
            for (w, head) in self.head_w.iter().enumerate() {
                let q: f64 =
                    head.iter().zip(&h).map(|(wi, hi)| wi * hi).sum::<f64>() + self.head_b[w];
                out[w].push(q);
            }
        }
        out
    }
}

fn pad_state(state: &[f64], dim: usize) -> Vec<f64> {
    let mut padded = state.to_vec();
    padded.resize(dim, 0.0);
    padded
}

pub fn load_value_net(path: &Path) -> Result<ValueNet> {
    let raw = fs::read_to_string(path).map_err(|e| Error::Artefact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let net: ValueNet = serde_json::from_str(&raw).map_err(|e| Error::Artefact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    net.validate()?;
    Ok(net)
}

pub fn load_quantile_net(path: &Path) -> Result<QuantileNet> {
    let raw = fs::read_to_string(path).map_err(|e| Error::Artefact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let net: QuantileNet = serde_json::from_str(&raw).map_err(|e| Error::Artefact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    net.validate()?;
    Ok(net)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_net_round_trips_through_json() {
        let net = ValueNet::zeros(3, 8);
        let json = serde_json::to_string(&net).unwrap();
        let back: ValueNet = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.num_workers, 3);
    }

    #[test]
    fn quantile_net_emits_one_row_per_worker() {
        let net = QuantileNet::zeros(10, 6, 4, 2);
        let taus = [0.25, 0.5, 0.95];
        let out = net.forward(&vec![0.5; 10], &taus);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|row| row.len() == taus.len()));
    }

    #[test]
    fn nonzero_head_bias_shifts_quantiles() {
        let mut net = QuantileNet::zeros(4, 3, 2, 2);
        net.head_b = vec![10.0, 20.0];
        let out = net.forward(&[0.0; 4], &[0.5]);
        assert_eq!(out[0][0], 10.0);
        assert_eq!(out[1][0], 20.0);
    }

    #[test]
    fn invalid_dimensions_fail_validation() {
        let mut net = ValueNet::zeros(2, 4);
        net.w1.pop();
        assert!(net.validate().is_err());
    }

    #[test]
    fn missing_file_reports_artefact_error() {
        let err = load_quantile_net(Path::new("/nonexistent/model.json")).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn garbage_json_reports_artefact_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, "not json at all").unwrap();
        assert!(load_value_net(&path).is_err());
    }
}
