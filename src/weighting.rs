//! GMM moment-condition weight-matrix strategies.
//!
//! Each strategy estimates the covariance `S` of the moment conditions `z_i ε_i`;
//! the estimators invert it to obtain the efficient weight matrix.

use std::fmt;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::covariance::CovarianceType;
use crate::error::{IvError, Result};
use crate::kernel::{cluster_count, cov_cluster, cov_kernel, optimal_bandwidth, KernelType};
use crate::linalg::{column_means, scale_rows};

/// Options recognized by the weight-matrix strategies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightConfig {
    /// Subtract the mean moment condition before forming `S`.
    pub center: bool,
    /// Apply a degree-of-freedom adjustment.
    pub debiased: bool,
    /// Kernel for `kernel` weight matrices.
    pub kernel: KernelType,
    /// Kernel bandwidth.
    pub bandwidth: Option<f64>,
    /// Choose the bandwidth automatically when none is supplied (otherwise `n - 2`).
    pub optimal_bandwidth: bool,
    /// Cluster labels, required by `clustered` weight matrices.
    pub clusters: Option<Vec<i64>>,
}

impl WeightConfig {
    pub fn with_center(mut self, center: bool) -> Self {
        self.center = center;
        self
    }

    pub fn with_debiased(mut self, debiased: bool) -> Self {
        self.debiased = debiased;
        self
    }

    pub fn with_kernel(mut self, kernel: KernelType) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: f64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn with_optimal_bandwidth(mut self, optimal: bool) -> Self {
        self.optimal_bandwidth = optimal;
        self
    }

    pub fn with_clusters(mut self, clusters: Vec<i64>) -> Self {
        self.clusters = Some(clusters);
        self
    }
}

/// Interface shared by the moment covariance estimators.
pub trait WeightMatrixEstimator: fmt::Debug + Send + Sync {
    /// Covariance of the moment conditions given regressors, instruments and residuals.
    fn weight_matrix(
        &self,
        x: &DMatrix<f64>,
        z: &DMatrix<f64>,
        eps: &DVector<f64>,
    ) -> Result<DMatrix<f64>>;

    /// Configuration recognized by the strategy.
    fn config(&self) -> &WeightConfig;
}

/// Builds the weight-matrix strategy registered under `weight_type`.
pub fn weight_estimator(
    weight_type: CovarianceType,
    config: WeightConfig,
) -> Result<Box<dyn WeightMatrixEstimator>> {
    let estimator: Box<dyn WeightMatrixEstimator> = match weight_type {
        CovarianceType::Unadjusted => Box::new(HomoskedasticWeight::new(config)),
        CovarianceType::Robust => Box::new(HeteroskedasticWeight::new(config)),
        CovarianceType::Kernel => Box::new(KernelWeight::new(config)?),
        CovarianceType::Clustered => Box::new(ClusteredWeight::new(config)?),
    };
    Ok(estimator)
}

/// Moment conditions `z ⊙ ε`, centered when requested.
fn moment_conditions(z: &DMatrix<f64>, eps: &DVector<f64>, center: bool) -> DMatrix<f64> {
    let mut ze = scale_rows(z, eps);
    if center {
        let mu = column_means(&ze);
        for mut row in ze.row_iter_mut() {
            row -= mu.transpose();
        }
    }
    ze
}

fn check_rows(x: &DMatrix<f64>, z: &DMatrix<f64>, eps: &DVector<f64>) -> Result<()> {
    if z.nrows() != x.nrows() {
        return Err(IvError::dimension_mismatch("instrument rows", x.nrows(), z.nrows()));
    }
    if eps.len() != x.nrows() {
        return Err(IvError::dimension_mismatch("residual length", x.nrows(), eps.len()));
    }
    Ok(())
}

fn debias_scale(config: &WeightConfig, nobs: usize, nvar: usize) -> f64 {
    if config.debiased {
        nobs as f64 / (nobs - nvar) as f64
    } else {
        1.0
    }
}

/// Homoskedastic weighting `s² z'z / n`.
#[derive(Clone, Debug)]
pub struct HomoskedasticWeight {
    config: WeightConfig,
}

impl HomoskedasticWeight {
    pub fn new(config: WeightConfig) -> Self {
        Self { config }
    }
}

impl WeightMatrixEstimator for HomoskedasticWeight {
    fn weight_matrix(
        &self,
        x: &DMatrix<f64>,
        z: &DMatrix<f64>,
        eps: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        check_rows(x, z, eps)?;
        let (nobs, nvar) = x.shape();
        let mu = if self.config.center { eps.mean() } else { 0.0 };
        let centered = eps.add_scalar(-mu);
        let denom = if self.config.debiased {
            (nobs - nvar) as f64
        } else {
            nobs as f64
        };
        let s2 = centered.dot(&centered) / denom;
        Ok(z.transpose() * z * (s2 / nobs as f64))
    }

    fn config(&self) -> &WeightConfig {
        &self.config
    }
}

/// Heteroskedasticity-robust weighting `(zε)'(zε) / n`.
#[derive(Clone, Debug)]
pub struct HeteroskedasticWeight {
    config: WeightConfig,
}

impl HeteroskedasticWeight {
    pub fn new(config: WeightConfig) -> Self {
        Self { config }
    }
}

impl WeightMatrixEstimator for HeteroskedasticWeight {
    fn weight_matrix(
        &self,
        x: &DMatrix<f64>,
        z: &DMatrix<f64>,
        eps: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        check_rows(x, z, eps)?;
        let (nobs, nvar) = x.shape();
        let ze = moment_conditions(z, eps, self.config.center);
        let s = ze.transpose() * &ze / nobs as f64;
        Ok(s * debias_scale(&self.config, nobs, nvar))
    }

    fn config(&self) -> &WeightConfig {
        &self.config
    }
}

/// Kernel (HAC) weighting of the moment conditions.
#[derive(Clone, Debug)]
pub struct KernelWeight {
    config: WeightConfig,
}

impl KernelWeight {
    pub fn new(config: WeightConfig) -> Result<Self> {
        if matches!(config.bandwidth, Some(bw) if bw < 0.0) {
            return Err(IvError::invalid_config("bandwidth must be non-negative"));
        }
        Ok(Self { config })
    }
}

impl WeightMatrixEstimator for KernelWeight {
    fn weight_matrix(
        &self,
        x: &DMatrix<f64>,
        z: &DMatrix<f64>,
        eps: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        check_rows(x, z, eps)?;
        let (nobs, nvar) = x.shape();
        let ze = moment_conditions(z, eps, self.config.center);
        let bandwidth = match self.config.bandwidth {
            Some(bw) => bw,
            None if self.config.optimal_bandwidth => {
                let combined = &ze * DVector::from_element(ze.ncols(), 1.0);
                let bw = optimal_bandwidth(&combined, self.config.kernel) as f64;
                debug!("automatic {} bandwidth: {bw}", self.config.kernel);
                bw
            }
            None => nobs.saturating_sub(2) as f64,
        };
        let weights = self.config.kernel.weights(bandwidth, nobs);
        let s = cov_kernel(&ze, &weights)?;
        Ok(s * debias_scale(&self.config, nobs, nvar))
    }

    fn config(&self) -> &WeightConfig {
        &self.config
    }
}

/// One-way cluster-robust weighting.
#[derive(Clone, Debug)]
pub struct ClusteredWeight {
    config: WeightConfig,
    clusters: Vec<i64>,
}

impl ClusteredWeight {
    pub fn new(config: WeightConfig) -> Result<Self> {
        let clusters = config
            .clusters
            .clone()
            .ok_or_else(|| IvError::invalid_config("clustered weight matrix requires clusters"))?;
        Ok(Self { config, clusters })
    }
}

impl WeightMatrixEstimator for ClusteredWeight {
    fn weight_matrix(
        &self,
        x: &DMatrix<f64>,
        z: &DMatrix<f64>,
        eps: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        check_rows(x, z, eps)?;
        let (nobs, nvar) = x.shape();
        let ze = moment_conditions(z, eps, self.config.center);
        let mut s = cov_cluster(&ze, &self.clusters)?;
        if self.config.debiased {
            let groups = cluster_count(&self.clusters) as f64;
            if groups < 2.0 {
                return Err(IvError::invalid_config(
                    "debiased clustered weight matrix requires at least two clusters",
                ));
            }
            let n = nobs as f64;
            s *= ((n - 1.0) / (n - nvar as f64)) * (groups / (groups - 1.0));
        }
        Ok(s)
    }

    fn config(&self) -> &WeightConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn moments() -> (DMatrix<f64>, DMatrix<f64>, DVector<f64>) {
        let x = DMatrix::from_row_slice(5, 1, &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let z = DMatrix::from_row_slice(
            5,
            2,
            &[1.0, 0.5, 1.0, -0.3, 1.0, 1.2, 1.0, 0.1, 1.0, -0.8],
        );
        let eps = DVector::from_vec(vec![0.4, -0.2, 0.1, -0.5, 0.3]);
        (x, z, eps)
    }

    #[test]
    fn homoskedastic_scales_instrument_cross_product() {
        let (x, z, eps) = moments();
        let w = HomoskedasticWeight::new(WeightConfig::default())
            .weight_matrix(&x, &z, &eps)
            .unwrap();
        let s2 = eps.dot(&eps) / 5.0;
        assert_relative_eq!(w, z.transpose() * &z * (s2 / 5.0), epsilon = 1e-12);
    }

    #[test]
    fn centering_removes_mean_moment() {
        let (x, z, eps) = moments();
        let raw = HeteroskedasticWeight::new(WeightConfig::default())
            .weight_matrix(&x, &z, &eps)
            .unwrap();
        let centered = HeteroskedasticWeight::new(WeightConfig::default().with_center(true))
            .weight_matrix(&x, &z, &eps)
            .unwrap();
        let g = column_means(&scale_rows(&z, &eps));
        assert_relative_eq!(centered, raw - &g * g.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn clustered_requires_labels() {
        assert!(matches!(
            weight_estimator(CovarianceType::Clustered, WeightConfig::default()),
            Err(IvError::InvalidConfiguration { .. })
        ));
        let (x, z, eps) = moments();
        let singletons = weight_estimator(
            CovarianceType::Clustered,
            WeightConfig::default().with_clusters(vec![0, 1, 2, 3, 4]),
        )
        .unwrap()
        .weight_matrix(&x, &z, &eps)
        .unwrap();
        let robust = weight_estimator(CovarianceType::Robust, WeightConfig::default())
            .unwrap()
            .weight_matrix(&x, &z, &eps)
            .unwrap();
        assert_relative_eq!(singletons, robust, epsilon = 1e-12);
    }

    #[test]
    fn kernel_with_zero_bandwidth_matches_robust() {
        let (x, z, eps) = moments();
        let kernel = weight_estimator(
            CovarianceType::Kernel,
            WeightConfig::default().with_bandwidth(0.0).with_debiased(true),
        )
        .unwrap()
        .weight_matrix(&x, &z, &eps)
        .unwrap();
        let robust = weight_estimator(
            CovarianceType::Robust,
            WeightConfig::default().with_debiased(true),
        )
        .unwrap()
        .weight_matrix(&x, &z, &eps)
        .unwrap();
        assert_relative_eq!(kernel, robust, epsilon = 1e-12);
    }
}
