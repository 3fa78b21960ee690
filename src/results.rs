//! Fitted-model payloads returned by every estimator.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, Normal, StudentsT};

use crate::covariance::{CovarianceConfig, CovarianceType};
use crate::weighting::WeightConfig;

/// Family of the fitted model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    /// No endogenous regressors and no instruments.
    Ols,
    /// k-class instrumental-variable fit.
    Iv,
    /// GMM or CUE fit.
    Gmm,
}

/// Wald-type test statistic with its reference distribution.
///
/// The p-value uses `χ²(df)` when `df_denom` is absent and `F(df, df_denom)` otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaldTest {
    pub stat: f64,
    pub df: usize,
    pub df_denom: Option<usize>,
    pub null: String,
    pub pval: f64,
}

impl WaldTest {
    pub fn new(stat: f64, df: usize, df_denom: Option<usize>, null: impl Into<String>) -> Self {
        let pval = if df == 0 || !stat.is_finite() {
            f64::NAN
        } else {
            match df_denom {
                None => ChiSquared::new(df as f64)
                    .ok()
                    .map_or(f64::NAN, |dist| dist.sf(stat)),
                Some(denom) => FisherSnedecor::new(df as f64, denom as f64)
                    .ok()
                    .map_or(f64::NAN, |dist| dist.sf(stat)),
            }
        };
        Self {
            stat,
            df,
            df_denom,
            null: null.into(),
            pval,
        }
    }

    /// Name of the reference distribution.
    pub fn dist_name(&self) -> String {
        match self.df_denom {
            None => format!("chi2({})", self.df),
            Some(denom) => format!("F({},{denom})", self.df),
        }
    }
}

/// A test that could be computed, or the reason it could not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TestStatistic {
    Valid(WaldTest),
    Invalid { reason: String },
}

impl TestStatistic {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    pub fn as_valid(&self) -> Option<&WaldTest> {
        match self {
            Self::Valid(test) => Some(test),
            Self::Invalid { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// κ actually used and the LIML κ estimated from the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KClassDiagnostics {
    pub kappa: f64,
    /// `None` for OLS or when the LIML eigenproblem could not be solved for a fixed κ.
    pub liml_kappa: Option<f64>,
    pub fuller: f64,
}

/// Summary of the numerical minimization behind a CUE fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSummary {
    pub iterations: u64,
    pub converged: bool,
    pub objective: f64,
    pub message: String,
}

/// Extras produced by the GMM estimators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GmmDiagnostics {
    /// Weight matrix used in the final parameter estimate.
    pub weight_matrix: DMatrix<f64>,
    pub weight_type: CovarianceType,
    pub weight_config: WeightConfig,
    /// Number of GMM steps, or the optimizer iteration count for CUE.
    pub iterations: usize,
    /// Hansen's J test of the overidentifying restrictions.
    pub j_stat: WaldTest,
    pub optimizer: Option<OptimizerSummary>,
}

/// Results of fitting an IV model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IvResults {
    pub kind: ResultKind,
    /// Estimator label, e.g. `IV-2SLS` or `IV-GMM`.
    pub method: String,
    pub dependent_name: String,
    pub params: DVector<f64>,
    pub param_names: Vec<String>,
    pub instrument_names: Vec<String>,
    pub residuals: DVector<f64>,
    pub weighted_residuals: DVector<f64>,
    pub fitted_values: DVector<f64>,
    pub cov: DMatrix<f64>,
    pub s2: f64,
    pub debiased: bool,
    pub cov_type: CovarianceType,
    /// Descriptive name of the covariance estimator.
    pub cov_estimator: String,
    /// Covariance configuration with automatic choices resolved.
    pub cov_config: CovarianceConfig,
    pub residual_ss: f64,
    pub total_ss: f64,
    pub r2: f64,
    /// Joint significance of the non-constant regressors.
    pub f_statistic: TestStatistic,
    pub nobs: usize,
    pub has_constant: bool,
    pub kclass: Option<KClassDiagnostics>,
    pub gmm: Option<GmmDiagnostics>,
}

impl IvResults {
    /// Number of estimated parameters.
    pub fn df_model(&self) -> usize {
        self.params.len()
    }

    /// Residual degrees of freedom `n - k`.
    pub fn df_resid(&self) -> usize {
        self.nobs.saturating_sub(self.params.len())
    }

    pub fn std_errors(&self) -> DVector<f64> {
        self.cov.diagonal().map(f64::sqrt)
    }

    pub fn tstats(&self) -> DVector<f64> {
        self.params.component_div(&self.std_errors())
    }

    /// Two-sided p-values, Student's t with `n - k` df when debiased, normal otherwise.
    pub fn pvalues(&self) -> DVector<f64> {
        let tstats = self.tstats();
        let cdf: Box<dyn Fn(f64) -> f64> = if self.debiased {
            match StudentsT::new(0.0, 1.0, self.df_resid() as f64) {
                Ok(dist) => Box::new(move |t| dist.cdf(t)),
                Err(_) => Box::new(|_| f64::NAN),
            }
        } else {
            match Normal::new(0.0, 1.0) {
                Ok(dist) => Box::new(move |t| dist.cdf(t)),
                Err(_) => Box::new(|_| f64::NAN),
            }
        };
        tstats.map(|t| 2.0 * (1.0 - cdf(t.abs())))
    }

    /// R² adjusted for the number of regressors.
    pub fn rsquared_adj(&self) -> f64 {
        let df_resid = self.df_resid() as f64;
        let n = self.nobs as f64 - if self.has_constant { 1.0 } else { 0.0 };
        1.0 - (1.0 - self.r2) * n / df_resid
    }

    /// Index of the parameter called `name`.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|n| n == name)
    }

    /// Value of the parameter called `name`.
    pub fn param(&self, name: &str) -> Option<f64> {
        self.param_index(name).map(|i| self.params[i])
    }
}
