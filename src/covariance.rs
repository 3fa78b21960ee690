//! Parameter covariance strategies selected by key.
//!
//! The k-class estimators share the bread `V = ((1-κ) x'x + κ x'P_z x) / n` and differ
//! in how they estimate the meat from the projected scores `x̂ ε` with `x̂ = P_z x`.
//! GMM estimators use [`GmmCovariance`], which borrows the meat from the matching
//! weight-matrix strategy.

use std::fmt;
use std::str::FromStr;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{IvError, Result};
use crate::kernel::{cluster_count, cov_cluster, cov_kernel, optimal_bandwidth, KernelType};
use crate::linalg::{has_constant, inverse, pinv, scale_rows, symmetrize};
use crate::weighting::{weight_estimator, WeightConfig};

/// Key selecting a covariance estimator or a GMM weight matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CovarianceType {
    /// Classic homoskedastic inference.
    Unadjusted,
    /// Heteroskedasticity-robust inference.
    #[default]
    Robust,
    /// Heteroskedasticity and autocorrelation robust (HAC) inference.
    Kernel,
    /// One-way cluster-robust inference.
    Clustered,
}

/// Alias used where the key selects a GMM moment-weighting strategy.
pub type WeightType = CovarianceType;

impl CovarianceType {
    /// Canonical key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unadjusted => "unadjusted",
            Self::Robust => "robust",
            Self::Kernel => "kernel",
            Self::Clustered => "clustered",
        }
    }
}

impl fmt::Display for CovarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CovarianceType {
    type Err = IvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unadjusted" | "homoskedastic" | "homo" => Ok(Self::Unadjusted),
            "robust" | "heteroskedastic" | "hccm" => Ok(Self::Robust),
            "kernel" => Ok(Self::Kernel),
            "clustered" | "one-way" | "cluster" => Ok(Self::Clustered),
            _ => Err(IvError::UnknownCovarianceType { key: s.to_string() }),
        }
    }
}

/// Options recognized by the covariance estimators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CovarianceConfig {
    /// Kernel for `kernel` covariances.
    pub kernel: KernelType,
    /// Kernel bandwidth; chosen automatically when absent.
    pub bandwidth: Option<f64>,
    /// Cluster labels for `clustered` covariances; one cluster per observation when absent.
    pub clusters: Option<Vec<i64>>,
    /// Center the moment conditions (GMM covariances only).
    pub center: bool,
}

impl CovarianceConfig {
    pub fn with_kernel(mut self, kernel: KernelType) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: f64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn with_clusters(mut self, clusters: Vec<i64>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    pub fn with_center(mut self, center: bool) -> Self {
        self.center = center;
        self
    }
}

/// Interface shared by every parameter covariance strategy.
pub trait CovarianceEstimator: fmt::Debug {
    /// Parameter covariance matrix.
    fn cov(&self) -> &DMatrix<f64>;
    /// Residual variance estimate.
    fn s2(&self) -> f64;
    /// Whether a small-sample degree-of-freedom adjustment was applied.
    fn debiased(&self) -> bool;
    /// Configuration actually used, with automatic choices resolved.
    fn config(&self) -> &CovarianceConfig;
    /// Descriptive name.
    fn name(&self) -> &'static str;
}

/// Weighted data and estimates consumed by the k-class covariance strategies.
#[derive(Clone, Copy, Debug)]
pub struct CovarianceInputs<'a> {
    pub x: &'a DMatrix<f64>,
    pub y: &'a DVector<f64>,
    pub z: &'a DMatrix<f64>,
    pub params: &'a DVector<f64>,
    pub kappa: f64,
}

/// Builds the k-class covariance estimator registered under `cov_type`.
pub fn kclass_covariance(
    cov_type: CovarianceType,
    inputs: CovarianceInputs<'_>,
    debiased: bool,
    config: &CovarianceConfig,
) -> Result<Box<dyn CovarianceEstimator>> {
    let estimator: Box<dyn CovarianceEstimator> = match cov_type {
        CovarianceType::Unadjusted => Box::new(HomoskedasticCovariance::new(inputs, debiased, config)?),
        CovarianceType::Robust => Box::new(HeteroskedasticCovariance::new(inputs, debiased, config)?),
        CovarianceType::Kernel => Box::new(KernelCovariance::new(inputs, debiased, config)?),
        CovarianceType::Clustered => Box::new(ClusteredCovariance::new(inputs, debiased, config)?),
    };
    Ok(estimator)
}

/// Pieces shared by the k-class sandwich estimators.
struct KClassParts {
    eps: DVector<f64>,
    xhat: DMatrix<f64>,
    bread: DMatrix<f64>,
    bread_inv: DMatrix<f64>,
    nobs: usize,
    scale: f64,
    s2: f64,
}

impl KClassParts {
    fn new(inputs: CovarianceInputs<'_>, debiased: bool) -> Result<Self> {
        let CovarianceInputs {
            x,
            y,
            z,
            params,
            kappa,
        } = inputs;
        let (nobs, nvar) = x.shape();
        if y.len() != nobs || z.nrows() != nobs {
            return Err(IvError::dimension_mismatch("covariance rows", nobs, y.len()));
        }
        if params.len() != nvar {
            return Err(IvError::dimension_mismatch(
                "covariance parameters",
                nvar,
                params.len(),
            ));
        }
        let n = nobs as f64;
        let eps = y - x * params;
        let xhat = z * (pinv(z)? * x);
        let mut bread = x.transpose() * &xhat / n;
        if kappa != 1.0 {
            bread = (x.transpose() * x / n) * (1.0 - kappa) + bread * kappa;
        }
        let bread_inv = inverse(&bread, "covariance bread")?;
        let scale = if debiased { n / (n - nvar as f64) } else { 1.0 };
        let s2 = scale * eps.dot(&eps) / n;
        Ok(Self {
            eps,
            xhat,
            bread,
            bread_inv,
            nobs,
            scale,
            s2,
        })
    }

    fn scores(&self) -> DMatrix<f64> {
        scale_rows(&self.xhat, &self.eps)
    }

    fn sandwich(&self, meat: &DMatrix<f64>) -> DMatrix<f64> {
        let c = &self.bread_inv * meat * &self.bread_inv / self.nobs as f64;
        symmetrize(&c)
    }
}

/// Homoskedastic (unadjusted) covariance.
#[derive(Clone, Debug)]
pub struct HomoskedasticCovariance {
    cov: DMatrix<f64>,
    s2: f64,
    debiased: bool,
    config: CovarianceConfig,
}

impl HomoskedasticCovariance {
    pub fn new(
        inputs: CovarianceInputs<'_>,
        debiased: bool,
        config: &CovarianceConfig,
    ) -> Result<Self> {
        let parts = KClassParts::new(inputs, debiased)?;
        let meat = &parts.bread * parts.s2;
        Ok(Self {
            cov: parts.sandwich(&meat),
            s2: parts.s2,
            debiased,
            config: config.clone(),
        })
    }
}

impl CovarianceEstimator for HomoskedasticCovariance {
    fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    fn s2(&self) -> f64 {
        self.s2
    }

    fn debiased(&self) -> bool {
        self.debiased
    }

    fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    fn name(&self) -> &'static str {
        "Unadjusted Covariance (Homoskedastic)"
    }
}

/// White heteroskedasticity-robust covariance.
#[derive(Clone, Debug)]
pub struct HeteroskedasticCovariance {
    cov: DMatrix<f64>,
    s2: f64,
    debiased: bool,
    config: CovarianceConfig,
}

impl HeteroskedasticCovariance {
    pub fn new(
        inputs: CovarianceInputs<'_>,
        debiased: bool,
        config: &CovarianceConfig,
    ) -> Result<Self> {
        let parts = KClassParts::new(inputs, debiased)?;
        let scores = parts.scores();
        let meat = scores.transpose() * &scores / parts.nobs as f64 * parts.scale;
        Ok(Self {
            cov: parts.sandwich(&meat),
            s2: parts.s2,
            debiased,
            config: config.clone(),
        })
    }
}

impl CovarianceEstimator for HeteroskedasticCovariance {
    fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    fn s2(&self) -> f64 {
        self.s2
    }

    fn debiased(&self) -> bool {
        self.debiased
    }

    fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    fn name(&self) -> &'static str {
        "Robust Covariance (Heteroskedastic)"
    }
}

/// Kernel (HAC) covariance.
#[derive(Clone, Debug)]
pub struct KernelCovariance {
    cov: DMatrix<f64>,
    s2: f64,
    debiased: bool,
    config: CovarianceConfig,
}

impl KernelCovariance {
    pub fn new(
        inputs: CovarianceInputs<'_>,
        debiased: bool,
        config: &CovarianceConfig,
    ) -> Result<Self> {
        let parts = KClassParts::new(inputs, debiased)?;
        let scores = parts.scores();
        let bandwidth = match config.bandwidth {
            Some(bw) if bw < 0.0 => {
                return Err(IvError::invalid_config("bandwidth must be non-negative"))
            }
            Some(bw) => bw,
            None => {
                let (_, loc) = has_constant(&parts.xhat);
                let selector = DVector::from_fn(scores.ncols(), |j, _| {
                    if Some(j) == loc {
                        0.0
                    } else {
                        1.0
                    }
                });
                let bw = optimal_bandwidth(&(&scores * selector), config.kernel) as f64;
                debug!("automatic {} bandwidth: {bw}", config.kernel);
                bw
            }
        };
        let weights = config.kernel.weights(bandwidth, parts.nobs);
        let meat = cov_kernel(&scores, &weights)? * parts.scale;

        let mut config = config.clone();
        config.bandwidth = Some(bandwidth);
        Ok(Self {
            cov: parts.sandwich(&meat),
            s2: parts.s2,
            debiased,
            config,
        })
    }

    /// Bandwidth used in estimation.
    pub fn bandwidth(&self) -> f64 {
        self.config.bandwidth.unwrap_or_default()
    }
}

impl CovarianceEstimator for KernelCovariance {
    fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    fn s2(&self) -> f64 {
        self.s2
    }

    fn debiased(&self) -> bool {
        self.debiased
    }

    fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    fn name(&self) -> &'static str {
        "Kernel Covariance (HAC)"
    }
}

/// One-way clustered covariance.
#[derive(Clone, Debug)]
pub struct ClusteredCovariance {
    cov: DMatrix<f64>,
    s2: f64,
    debiased: bool,
    config: CovarianceConfig,
}

impl ClusteredCovariance {
    pub fn new(
        inputs: CovarianceInputs<'_>,
        debiased: bool,
        config: &CovarianceConfig,
    ) -> Result<Self> {
        let parts = KClassParts::new(inputs, debiased)?;
        let clusters = resolve_clusters(config, parts.nobs)?;
        let mut meat = cov_cluster(&parts.scores(), &clusters)?;
        if debiased {
            let groups = cluster_count(&clusters) as f64;
            if groups < 2.0 {
                return Err(IvError::invalid_config(
                    "debiased clustered covariance requires at least two clusters",
                ));
            }
            let n = parts.nobs as f64;
            meat *= parts.scale * (groups / (groups - 1.0)) * ((n - 1.0) / n);
        }
        Ok(Self {
            cov: parts.sandwich(&meat),
            s2: parts.s2,
            debiased,
            config: config.clone(),
        })
    }
}

impl CovarianceEstimator for ClusteredCovariance {
    fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    fn s2(&self) -> f64 {
        self.s2
    }

    fn debiased(&self) -> bool {
        self.debiased
    }

    fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    fn name(&self) -> &'static str {
        "One-way Clustered Covariance"
    }
}

fn resolve_clusters(config: &CovarianceConfig, nobs: usize) -> Result<Vec<i64>> {
    match &config.clusters {
        Some(clusters) if clusters.len() != nobs => Err(IvError::dimension_mismatch(
            "cluster labels",
            nobs,
            clusters.len(),
        )),
        Some(clusters) => Ok(clusters.clone()),
        None => Ok((0..nobs as i64).collect()),
    }
}

/// Covariance of GMM parameter estimates for a fixed weight matrix.
#[derive(Clone, Debug)]
pub struct GmmCovariance {
    cov: DMatrix<f64>,
    s2: f64,
    debiased: bool,
    cov_type: CovarianceType,
    config: CovarianceConfig,
}

impl GmmCovariance {
    /// `x, y, z` are the weighted data, `w` the weight matrix used in estimation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        z: &DMatrix<f64>,
        params: &DVector<f64>,
        w: &DMatrix<f64>,
        cov_type: CovarianceType,
        debiased: bool,
        config: &CovarianceConfig,
    ) -> Result<Self> {
        let (nobs, nvar) = x.shape();
        if params.len() != nvar {
            return Err(IvError::dimension_mismatch(
                "covariance parameters",
                nvar,
                params.len(),
            ));
        }
        if w.nrows() != z.ncols() || w.ncols() != z.ncols() {
            return Err(IvError::dimension_mismatch(
                "weight matrix dimension",
                z.ncols(),
                w.nrows(),
            ));
        }
        let n = nobs as f64;
        let eps = y - x * params;

        let clusters = match cov_type {
            CovarianceType::Clustered => Some(resolve_clusters(config, nobs)?),
            _ => None,
        };
        let score_config = WeightConfig {
            center: config.center,
            debiased,
            kernel: config.kernel,
            bandwidth: config.bandwidth,
            optimal_bandwidth: config.bandwidth.is_none(),
            clusters,
        };
        let score_cov = weight_estimator(cov_type, score_config)?.weight_matrix(x, z, &eps)?;

        let xpz = x.transpose() * z / n;
        let xpzw = &xpz * w;
        let xpzwzpx_inv = inverse(&(&xpzw * xpz.transpose()), "X'ZWZ'X")?;
        let c = &xpzwzpx_inv * (&xpzw * score_cov * xpzw.transpose()) * &xpzwzpx_inv / n;

        let scale = if debiased { n / (n - nvar as f64) } else { 1.0 };
        Ok(Self {
            cov: symmetrize(&c),
            s2: scale * eps.dot(&eps) / n,
            debiased,
            cov_type,
            config: config.clone(),
        })
    }

    pub fn cov_type(&self) -> CovarianceType {
        self.cov_type
    }
}

impl CovarianceEstimator for GmmCovariance {
    fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    fn s2(&self) -> f64 {
        self.s2
    }

    fn debiased(&self) -> bool {
        self.debiased
    }

    fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    fn name(&self) -> &'static str {
        "GMM Covariance"
    }
}
