//! Continuously-updating GMM.
//!
//! The weight matrix is re-estimated at every trial parameter vector, so
//!
//! ```text
//! J(β) = n · ḡ(β)' S(β)⁻¹ ḡ(β),   ḡ(β) = mean(z ⊙ (y - xβ))
//! ```
//!
//! has no closed-form minimizer and is handed to a [`Minimizer`].

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::covariance::WeightType;
use crate::data::ModelData;
use crate::error::{IvError, Result};
use crate::estimation::IvEstimator;
use crate::gmm::GmmEstimator;
use crate::linalg::{column_means, inverse, scale_rows};
use crate::optimize::{Lbfgs, Minimizer, Minimum};
use crate::options::{CueOptions, GmmOptions};
use crate::results::{IvResults, OptimizerSummary};
use crate::weighting::{WeightConfig, WeightMatrixEstimator};

/// CUE-GMM IV estimator.
#[derive(Debug)]
pub struct CueGmmEstimator<'a> {
    gmm: GmmEstimator<'a>,
}

impl<'a> CueGmmEstimator<'a> {
    pub fn new(data: &'a ModelData, weight_type: WeightType, weight_config: WeightConfig) -> Result<Self> {
        Ok(Self {
            gmm: GmmEstimator::new(data, weight_type, weight_config)?,
        })
    }

    pub fn weight_type(&self) -> WeightType {
        self.gmm.weight_type()
    }

    pub fn weight_config(&self) -> &WeightConfig {
        self.gmm.weight_config()
    }

    /// CUE objective at `params` for the given (weighted) data.
    pub fn j(
        &self,
        params: &DVector<f64>,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        z: &DMatrix<f64>,
    ) -> Result<f64> {
        cue_objective(self.gmm.weighter(), params, x, y, z)
    }

    /// Minimizes the CUE objective from `starting`.
    ///
    /// Usable with resampled data; the returned [`Minimum`] reports whether the
    /// minimizer converged.
    pub fn estimate_parameters(
        &self,
        starting: &DVector<f64>,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        z: &DMatrix<f64>,
        minimizer: &dyn Minimizer,
    ) -> Result<(DVector<f64>, Minimum)> {
        if starting.len() != x.ncols() {
            return Err(IvError::InvalidStartingValues {
                expected: x.ncols(),
                found: starting.len(),
            });
        }
        let weighter = self.gmm.weighter();
        let objective = |p: &[f64]| -> Result<f64> {
            cue_objective(weighter, &DVector::from_column_slice(p), x, y, z)
        };
        let minimum = minimizer.minimize(&objective, starting.as_slice())?;
        Ok((DVector::from_column_slice(&minimum.point), minimum))
    }

    /// Fits the model with a caller-supplied minimizer.
    pub fn fit_with_minimizer(&self, options: &CueOptions, minimizer: &dyn Minimizer) -> Result<IvResults> {
        let data = self.gmm.data();
        let (wx, wy, wz) = (data.wx(), data.wy(), data.wz());
        let starting = match &options.starting {
            Some(starting) if starting.len() != data.nvar() => {
                return Err(IvError::InvalidStartingValues {
                    expected: data.nvar(),
                    found: starting.len(),
                })
            }
            Some(starting) => starting.clone(),
            None => self.gmm.iterate(&GmmOptions::default())?.params,
        };

        let (params, minimum) = self.estimate_parameters(&starting, wx, wy, wz, minimizer)?;
        if !minimum.converged {
            warn!("CUE minimization did not converge: {}", minimum.message);
        }
        let eps = wy - wx * &params;
        let wmat = inverse(
            &self.gmm.weighter().weight_matrix(wx, wz, &eps)?,
            "moment condition covariance",
        )?;
        let summary = OptimizerSummary {
            iterations: minimum.iterations,
            converged: minimum.converged,
            objective: minimum.value,
            message: minimum.message,
        };
        self.gmm.finish(
            self.method(),
            params,
            wmat,
            minimum.iterations as usize,
            &options.covariance,
            Some(summary),
        )
    }
}

impl IvEstimator for CueGmmEstimator<'_> {
    type Options = CueOptions;

    fn data(&self) -> &ModelData {
        self.gmm.data()
    }

    fn method(&self) -> String {
        "IV-GMM-CUE".to_string()
    }

    fn fit(&self, options: &CueOptions) -> Result<IvResults> {
        self.fit_with_minimizer(options, &Lbfgs::new(options.optimizer.clone()))
    }
}

fn cue_objective(
    weighter: &dyn WeightMatrixEstimator,
    params: &DVector<f64>,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    z: &DMatrix<f64>,
) -> Result<f64> {
    if params.len() != x.ncols() {
        return Err(IvError::dimension_mismatch("parameter length", x.ncols(), params.len()));
    }
    let nobs = y.len() as f64;
    let eps = y - x * params;
    let w = inverse(&weighter.weight_matrix(x, z, &eps)?, "moment condition covariance")?;
    let g_bar = column_means(&scale_rows(z, &eps));
    Ok(nobs * g_bar.dot(&(w * &g_bar)))
}
