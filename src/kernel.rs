//! HAC kernels, automatic bandwidth selection and long-run covariance of scores.
//!
//! ```text
//! S = (1/n) [ Γ_0 + Σ_{j=1}^{L} w_j (Γ_j + Γ_j') ],   Γ_j = Σ_{t=j}^{n-1} s_t s_{t-j}'
//! ```

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{IvError, Result};

/// Kernel used to weight autocovariances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelType {
    /// Bartlett (Newey-West) triangular kernel.
    #[default]
    Bartlett,
    /// Parzen (Gallant) kernel.
    Parzen,
    /// Quadratic-spectral (Andrews) kernel.
    QuadraticSpectral,
}

impl KernelType {
    /// Canonical key of the kernel.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bartlett => "bartlett",
            Self::Parzen => "parzen",
            Self::QuadraticSpectral => "qs",
        }
    }

    /// Kernel weights `w_0 = 1, w_1, ...` for the given bandwidth and sample size.
    pub fn weights(&self, bandwidth: f64, nobs: usize) -> Vec<f64> {
        let bw = bandwidth.max(0.0);
        match self {
            Self::Bartlett => {
                let lags = bw.floor() as usize;
                (0..=lags)
                    .map(|j| 1.0 - j as f64 / (lags as f64 + 1.0))
                    .collect()
            }
            Self::Parzen => {
                let lags = bw.floor() as usize;
                (0..=lags)
                    .map(|j| {
                        let z = j as f64 / (lags as f64 + 1.0);
                        if z <= 0.5 {
                            1.0 - 6.0 * z * z + 6.0 * z * z * z
                        } else {
                            2.0 * (1.0 - z).powi(3)
                        }
                    })
                    .collect()
            }
            Self::QuadraticSpectral => {
                if bw == 0.0 {
                    return vec![1.0];
                }
                (0..nobs.max(1))
                    .map(|j| {
                        if j == 0 {
                            return 1.0;
                        }
                        let x = 6.0 * PI * (j as f64 / bw) / 5.0;
                        3.0 / (x * x) * (x.sin() / x - x.cos())
                    })
                    .collect()
            }
        }
    }

    /// `(q, c, exponent)` constants of the Newey-West (1994) plug-in rule.
    fn plug_in_constants(&self) -> (i32, f64, f64) {
        match self {
            Self::Bartlett => (1, 1.1447, 2.0 / 9.0),
            Self::Parzen => (2, 2.6614, 4.0 / 25.0),
            Self::QuadraticSpectral => (2, 1.3221, 2.0 / 25.0),
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelType {
    type Err = IvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bartlett" | "newey-west" => Ok(Self::Bartlett),
            "parzen" | "gallant" => Ok(Self::Parzen),
            "qs" | "quadratic-spectral" | "andrews" => Ok(Self::QuadraticSpectral),
            _ => Err(IvError::UnknownKernel { key: s.to_string() }),
        }
    }
}

/// Newey-West (1994) automatic bandwidth for a univariate score series.
pub fn optimal_bandwidth(series: &DVector<f64>, kernel: KernelType) -> usize {
    let t = series.len();
    if t < 2 {
        return 0;
    }
    let (q, c, exponent) = kernel.plug_in_constants();
    let m_star = ((4.0 * (t as f64 / 100.0).powf(exponent)).ceil() as usize).min(t - 1);

    let autocov = |lag: usize| -> f64 {
        (lag..t).map(|i| series[i] * series[i - lag]).sum::<f64>() / t as f64
    };
    let sigma: Vec<f64> = (0..=m_star).map(autocov).collect();
    let s0 = sigma[0] + 2.0 * sigma[1..].iter().sum::<f64>();
    let sq = 2.0
        * sigma
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, s)| s * (i as f64).powi(q))
            .sum::<f64>();

    let rate = 1.0 / (2.0 * q as f64 + 1.0);
    let gamma = c * ((sq / s0).powi(2)).powf(rate);
    let m = gamma * (t as f64).powf(rate);
    if !m.is_finite() {
        return 0;
    }
    (m.ceil() as usize).min(t - 1)
}

/// Kernel-weighted long-run covariance of the rows of `scores`.
pub fn cov_kernel(scores: &DMatrix<f64>, weights: &[f64]) -> Result<DMatrix<f64>> {
    let n = scores.nrows();
    if weights.len() > n {
        return Err(IvError::invalid_config(format!(
            "kernel uses {} lags but only {n} observations are available",
            weights.len().saturating_sub(1)
        )));
    }
    let mut s = scores.transpose() * scores;
    for (lag, weight) in weights.iter().enumerate().skip(1) {
        if *weight == 0.0 {
            continue;
        }
        let lead: Vec<usize> = (lag..n).collect();
        let lagged: Vec<usize> = (0..n - lag).collect();
        let gamma = scores.select_rows(lead.iter()).transpose() * scores.select_rows(lagged.iter());
        s += (&gamma + gamma.transpose()) * *weight;
    }
    Ok(s / n as f64)
}

/// Sum of within-cluster outer products of the cluster score totals, divided by `n`.
pub fn cov_cluster(scores: &DMatrix<f64>, clusters: &[i64]) -> Result<DMatrix<f64>> {
    let (n, k) = scores.shape();
    if clusters.len() != n {
        return Err(IvError::dimension_mismatch("cluster labels", n, clusters.len()));
    }
    let mut totals: BTreeMap<i64, DVector<f64>> = BTreeMap::new();
    for (row, label) in clusters.iter().enumerate() {
        let total = totals.entry(*label).or_insert_with(|| DVector::zeros(k));
        *total += scores.row(row).transpose();
    }
    let mut s = DMatrix::zeros(k, k);
    for total in totals.values() {
        s += total * total.transpose();
    }
    Ok(s / n as f64)
}

/// Number of distinct cluster labels.
pub fn cluster_count(clusters: &[i64]) -> usize {
    let mut sorted = clusters.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.len()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn bartlett_and_parzen_weights() {
        let bartlett = KernelType::Bartlett.weights(3.0, 100);
        assert_eq!(bartlett.len(), 4);
        assert_relative_eq!(bartlett[1], 0.75);
        assert_relative_eq!(bartlett[3], 0.25);

        let parzen = KernelType::Parzen.weights(3.0, 100);
        assert_relative_eq!(parzen[0], 1.0);
        assert_relative_eq!(parzen[1], 1.0 - 6.0 / 16.0 + 6.0 / 64.0);
        assert_relative_eq!(parzen[3], 2.0 * 0.25_f64.powi(3));
    }

    #[test]
    fn quadratic_spectral_weights_decay() {
        let qs = KernelType::QuadraticSpectral.weights(5.0, 50);
        assert_eq!(qs.len(), 50);
        assert_relative_eq!(qs[0], 1.0);
        assert!(qs[1] < 1.0 && qs[1] > qs[5]);
    }

    #[test]
    fn kernel_keys_parse() {
        assert_eq!("newey-west".parse::<KernelType>().unwrap(), KernelType::Bartlett);
        assert_eq!("Andrews".parse::<KernelType>().unwrap(), KernelType::QuadraticSpectral);
        assert!(matches!(
            "triangle".parse::<KernelType>(),
            Err(IvError::UnknownKernel { .. })
        ));
    }

    #[test]
    fn zero_bandwidth_reduces_to_outer_product() {
        let scores = DMatrix::from_row_slice(4, 2, &[1.0, 2.0, -1.0, 0.5, 0.3, -0.2, 2.0, 1.0]);
        let s = cov_kernel(&scores, &KernelType::Bartlett.weights(0.0, 4)).unwrap();
        assert_relative_eq!(s, scores.transpose() * &scores / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn singleton_clusters_match_outer_product() {
        let scores = DMatrix::from_row_slice(3, 1, &[1.0, -2.0, 0.5]);
        let singletons = cov_cluster(&scores, &[0, 1, 2]).unwrap();
        assert_relative_eq!(singletons[(0, 0)], (1.0 + 4.0 + 0.25) / 3.0, epsilon = 1e-12);

        let pooled = cov_cluster(&scores, &[7, 7, 9]).unwrap();
        assert_relative_eq!(pooled[(0, 0)], (1.0 + 0.25) / 3.0, epsilon = 1e-12);
        assert_eq!(cluster_count(&[7, 7, 9]), 2);
    }

    #[test]
    fn optimal_bandwidth_is_bounded() {
        let series = DVector::from_fn(200, |i, _| ((i as f64) * 0.7).sin());
        let bw = optimal_bandwidth(&series, KernelType::Bartlett);
        assert!(bw < 200);
    }
}
