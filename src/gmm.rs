//! Two-step and iterated efficient GMM.
//!
//! Starting from 2SLS, each step re-estimates the moment covariance `S` from the current
//! residuals and solves
//!
//! ```text
//! β = [(x'z) W (z'x)]⁻¹ (x'z) W (z'y),   W = S⁻¹
//! ```
//!
//! Iteration stops when `δ' V⁻¹ δ ≤ tol` or after `iter_limit` steps. `V` is the
//! asymptotic variance from the first update and is not refreshed afterwards.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::covariance::{CovarianceEstimator, GmmCovariance, WeightType};
use crate::data::ModelData;
use crate::error::{IvError, Result};
use crate::estimation::{align_cov_config, align_weight_config, j_statistic, post_estimation, IvEstimator};
use crate::kclass::estimate_kclass_parameters;
use crate::linalg::inverse;
use crate::options::{CovarianceOptions, GmmOptions, WeightingMatrix};
use crate::results::{GmmDiagnostics, IvResults, OptimizerSummary, ResultKind};
use crate::weighting::{weight_estimator, WeightConfig, WeightMatrixEstimator};

/// Parameters and weight matrix at the end of the GMM iteration.
#[derive(Clone, Debug)]
pub struct GmmIteration {
    pub params: DVector<f64>,
    pub weight_matrix: DMatrix<f64>,
    pub iterations: usize,
    /// Last normalized parameter change.
    pub norm: f64,
}

/// Efficient GMM IV estimator.
#[derive(Debug)]
pub struct GmmEstimator<'a> {
    data: &'a ModelData,
    weight_type: WeightType,
    weighter: Box<dyn WeightMatrixEstimator>,
}

impl<'a> GmmEstimator<'a> {
    /// Creates the estimator; cluster labels in `weight_config` may cover all supplied
    /// rows or only the retained ones.
    pub fn new(data: &'a ModelData, weight_type: WeightType, weight_config: WeightConfig) -> Result<Self> {
        let weight_config = align_weight_config(data, &weight_config)?;
        let weighter = weight_estimator(weight_type, weight_config)?;
        Ok(Self {
            data,
            weight_type,
            weighter,
        })
    }

    pub fn weight_type(&self) -> WeightType {
        self.weight_type
    }

    pub fn weight_config(&self) -> &WeightConfig {
        self.weighter.config()
    }

    pub(crate) fn weighter(&self) -> &dyn WeightMatrixEstimator {
        self.weighter.as_ref()
    }

    /// Runs the GMM iteration on the weighted data.
    pub fn iterate(&self, options: &GmmOptions) -> Result<GmmIteration> {
        let data = self.data;
        let (wx, wy, wz) = (data.wx(), data.wy(), data.wz());
        let initial = initial_weight_matrix(wz, &options.initial_weight)?;
        iterate_gmm(
            wx,
            wy,
            wz,
            &initial,
            self.weighter(),
            options.iter_limit,
            options.tolerance,
        )
    }

    /// Covariance, J statistic and results for parameters estimated with weight matrix `wmat`.
    pub(crate) fn finish(
        &self,
        method: String,
        params: DVector<f64>,
        wmat: DMatrix<f64>,
        iterations: usize,
        covariance: &CovarianceOptions,
        optimizer: Option<OptimizerSummary>,
    ) -> Result<IvResults> {
        let data = self.data;
        let (wx, wy, wz) = (data.wx(), data.wy(), data.wz());
        let cov_config = align_cov_config(data, &covariance.config)?;
        let cov_estimator = GmmCovariance::new(
            wx,
            wy,
            wz,
            &params,
            &wmat,
            covariance.cov_type,
            covariance.debiased,
            &cov_config,
        )?;
        let j_stat = j_statistic(wx, wy, wz, &params, &wmat);
        debug!(
            "{method}: {} covariance, J = {:.6} on {} df",
            cov_estimator.name(),
            j_stat.stat,
            j_stat.df
        );

        let mut results = post_estimation(
            data,
            ResultKind::Gmm,
            method,
            params,
            covariance.cov_type,
            &cov_estimator,
        )?;
        results.gmm = Some(GmmDiagnostics {
            weight_matrix: wmat,
            weight_type: self.weight_type,
            weight_config: self.weighter.config().clone(),
            iterations,
            j_stat,
            optimizer,
        });
        Ok(results)
    }
}

impl IvEstimator for GmmEstimator<'_> {
    type Options = GmmOptions;

    fn data(&self) -> &ModelData {
        self.data
    }

    fn method(&self) -> String {
        "IV-GMM".to_string()
    }

    fn fit(&self, options: &GmmOptions) -> Result<IvResults> {
        let GmmIteration {
            params,
            weight_matrix,
            iterations,
            ..
        } = self.iterate(options)?;
        self.finish(
            self.method(),
            params,
            weight_matrix,
            iterations,
            &options.covariance,
            None,
        )
    }
}

/// Resolves the starting weight matrix for instruments `z`.
pub fn initial_weight_matrix(z: &DMatrix<f64>, initial: &WeightingMatrix) -> Result<DMatrix<f64>> {
    let ninstr = z.ncols();
    match initial {
        WeightingMatrix::InverseZTZ => {
            let nobs = z.nrows() as f64;
            inverse(&(z.transpose() * z / nobs), "Z'Z/n")
        }
        WeightingMatrix::Provided(matrix) => {
            if matrix.nrows() != ninstr || matrix.ncols() != ninstr {
                return Err(IvError::dimension_mismatch(
                    "initial weight matrix",
                    ninstr,
                    matrix.nrows().max(matrix.ncols()),
                ));
            }
            Ok(matrix.clone())
        }
    }
}

/// Closed-form GMM estimate for a fixed weight matrix `w`.
pub fn estimate_gmm_parameters(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    w: &DMatrix<f64>,
) -> Result<DVector<f64>> {
    let n = x.nrows();
    if y.len() != n || z.nrows() != n {
        return Err(IvError::dimension_mismatch("GMM data rows", n, z.nrows()));
    }
    if w.nrows() != z.ncols() || w.ncols() != z.ncols() {
        return Err(IvError::dimension_mismatch("weight matrix dimension", z.ncols(), w.nrows()));
    }
    let xpz = x.transpose() * z;
    let zpy = z.transpose() * y;
    let xpzw = &xpz * w;
    Ok(inverse(&(&xpzw * xpz.transpose()), "X'ZWZ'X")? * (xpzw * zpy))
}

/// Iterated GMM on weighted data starting from 2SLS.
///
/// `initial` is the weight matrix reported when no update is performed (`iter_limit <= 1`).
pub fn iterate_gmm(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    initial: &DMatrix<f64>,
    weighter: &dyn WeightMatrixEstimator,
    iter_limit: usize,
    tol: f64,
) -> Result<GmmIteration> {
    let nobs = x.nrows() as f64;
    let mut wmat = initial.clone();
    let mut params = estimate_kclass_parameters(x, y, z, 1.0)?;
    let mut iterations = 1;
    let mut norm = 10.0 * tol + 1.0;
    let mut vinv = DMatrix::identity(params.len(), params.len());

    while iterations < iter_limit && norm > tol {
        let eps = y - x * &params;
        wmat = inverse(&weighter.weight_matrix(x, z, &eps)?, "moment condition covariance")?;
        let updated = estimate_gmm_parameters(x, y, z, &wmat)?;
        let delta = &updated - &params;
        if iterations == 1 {
            let xpz = x.transpose() * z / nobs;
            let v = (&xpz * &wmat * xpz.transpose()) / nobs;
            vinv = inverse(&v, "GMM asymptotic variance")?;
        }
        params = updated;
        norm = delta.dot(&(&vinv * &delta));
        iterations += 1;
        debug!("GMM step {iterations}: normalized change {norm:.3e}");
    }

    Ok(GmmIteration {
        params,
        weight_matrix: wmat,
        iterations,
        norm,
    })
}
