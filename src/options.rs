//! Configuration structures for fitting the k-class, GMM and CUE estimators.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::covariance::{CovarianceConfig, CovarianceType};
use crate::optimize::OptimizerOptions;

/// Parameter covariance choice shared by every estimator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CovarianceOptions {
    /// Covariance strategy.
    pub cov_type: CovarianceType,
    /// Apply the small-sample `n / (n - k)` adjustment and report F rather than chi-squared tests.
    pub debiased: bool,
    /// Strategy-specific settings.
    pub config: CovarianceConfig,
}

impl CovarianceOptions {
    pub fn new(cov_type: CovarianceType) -> Self {
        Self {
            cov_type,
            ..Self::default()
        }
    }

    pub fn with_cov_type(mut self, cov_type: CovarianceType) -> Self {
        self.cov_type = cov_type;
        self
    }

    pub fn with_debiased(mut self, debiased: bool) -> Self {
        self.debiased = debiased;
        self
    }

    pub fn with_config(mut self, config: CovarianceConfig) -> Self {
        self.config = config;
        self
    }
}

/// Choice of κ for the k-class family.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LimlOptions {
    /// Fuller's α; `κ = κ_liml − α / (n − n_instr)`.
    pub fuller: f64,
    /// Explicit κ, overriding the LIML estimate and the Fuller adjustment.
    pub kappa: Option<f64>,
}

impl LimlOptions {
    pub fn with_fuller(mut self, fuller: f64) -> Self {
        self.fuller = fuller;
        self
    }

    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa = Some(kappa);
        self
    }
}

/// Initial weighting matrix of the GMM iteration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum WeightingMatrix {
    /// Use `inverse(z'z / n)`, which makes the first step 2SLS.
    #[default]
    InverseZTZ,
    /// Provide a custom positive-definite weighting matrix.
    Provided(DMatrix<f64>),
}

/// Controls the iterated GMM loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GmmOptions {
    /// Maximum number of estimation steps; 2 gives two-step efficient GMM.
    pub iter_limit: usize,
    /// Convergence tolerance on the normalized parameter change.
    pub tolerance: f64,
    /// Starting weighting matrix.
    pub initial_weight: WeightingMatrix,
    /// Parameter covariance choice.
    pub covariance: CovarianceOptions,
}

impl Default for GmmOptions {
    fn default() -> Self {
        Self {
            iter_limit: 2,
            tolerance: 1e-4,
            initial_weight: WeightingMatrix::InverseZTZ,
            covariance: CovarianceOptions::default(),
        }
    }
}

impl GmmOptions {
    /// Set the maximum number of GMM steps (at least one).
    pub fn with_iter_limit(mut self, iter_limit: usize) -> Self {
        self.iter_limit = iter_limit.max(1);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_initial_weight(mut self, weighting: WeightingMatrix) -> Self {
        self.initial_weight = weighting;
        self
    }

    pub fn with_covariance(mut self, covariance: CovarianceOptions) -> Self {
        self.covariance = covariance;
        self
    }
}

/// Controls the continuously-updating GMM minimization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CueOptions {
    /// Starting parameters; a two-step GMM fit is used when absent.
    pub starting: Option<DVector<f64>>,
    /// Parameter covariance choice.
    pub covariance: CovarianceOptions,
    /// Settings forwarded to the minimizer.
    pub optimizer: OptimizerOptions,
}

impl CueOptions {
    pub fn with_starting(mut self, starting: DVector<f64>) -> Self {
        self.starting = Some(starting);
        self
    }

    pub fn with_covariance(mut self, covariance: CovarianceOptions) -> Self {
        self.covariance = covariance;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerOptions) -> Self {
        self.optimizer = optimizer;
        self
    }
}
