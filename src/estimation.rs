//! The common `fit` contract and the post-estimation statistics shared by every estimator.

use nalgebra::{DMatrix, DVector};

use crate::covariance::{CovarianceConfig, CovarianceEstimator, CovarianceType};
use crate::data::ModelData;
use crate::error::Result;
use crate::linalg::{column_means, find_constant, inverse, scale_rows};
use crate::results::{IvResults, ResultKind, TestStatistic, WaldTest};
use crate::weighting::WeightConfig;

/// Contract implemented by the k-class, GMM and CUE estimators.
///
/// Estimators borrow validated [`ModelData`] and are stateless across fits, so the
/// same estimator can be fitted repeatedly with different options.
pub trait IvEstimator {
    /// Options accepted by [`fit`](Self::fit).
    type Options;

    /// Validated data the estimator operates on.
    fn data(&self) -> &ModelData;

    /// Estimator label reported in the results.
    fn method(&self) -> String;

    /// Estimates the model.
    fn fit(&self, options: &Self::Options) -> Result<IvResults>;

    /// Residuals `y - x·params` for arbitrary parameters.
    fn resids(&self, params: &DVector<f64>) -> Result<DVector<f64>> {
        self.data().resids(params)
    }

    /// Weighted residuals `wy - wx·params` for arbitrary parameters.
    fn weighted_resids(&self, params: &DVector<f64>) -> Result<DVector<f64>> {
        self.data().weighted_resids(params)
    }

    /// Fitted values for new exogenous and endogenous data.
    fn predict(
        &self,
        params: &DVector<f64>,
        exog: &DMatrix<f64>,
        endog: &DMatrix<f64>,
    ) -> Result<DVector<f64>> {
        self.data().predict(params, exog, endog)
    }
}

/// Computes fit statistics and packages the results of any estimator.
///
/// `covariance` must have been computed from the same `params`.
pub fn post_estimation(
    data: &ModelData,
    kind: ResultKind,
    method: String,
    params: DVector<f64>,
    cov_type: CovarianceType,
    covariance: &dyn CovarianceEstimator,
) -> Result<IvResults> {
    let residuals = data.resids(&params)?;
    let weighted_residuals = data.weighted_resids(&params)?;
    let fitted_values = data.x() * &params;

    let residual_ss = weighted_residuals.dot(&weighted_residuals);
    let mut centered = data.wy().clone();
    if data.has_constant() {
        let weights = data.weights();
        let mu = weights.dot(data.dependent()) / weights.sum();
        centered -= data.sqrt_weights() * mu;
    }
    let total_ss = centered.dot(&centered);
    let r2 = 1.0 - residual_ss / total_ss;

    let cov = covariance.cov().clone();
    let debiased = covariance.debiased();
    let f_statistic = f_statistic(&params, &cov, debiased, data.nobs(), find_constant(data.x()));

    Ok(IvResults {
        kind,
        method,
        dependent_name: data.dependent_name().to_string(),
        param_names: data.regressor_names().to_vec(),
        instrument_names: data.instrument_names().to_vec(),
        params,
        residuals,
        weighted_residuals,
        fitted_values,
        cov,
        s2: covariance.s2(),
        debiased,
        cov_type,
        cov_estimator: covariance.name().to_string(),
        cov_config: covariance.config().clone(),
        residual_ss,
        total_ss,
        r2,
        f_statistic,
        nobs: data.nobs(),
        has_constant: data.has_constant(),
        kclass: None,
        gmm: None,
    })
}

/// Wald test that every coefficient except the constant at `const_loc` is zero.
///
/// Uses `stat / df ~ F(df, n - k)` when `debiased`, otherwise `stat ~ χ²(df)`.
pub fn f_statistic(
    params: &DVector<f64>,
    cov: &DMatrix<f64>,
    debiased: bool,
    nobs: usize,
    const_loc: Option<usize>,
) -> TestStatistic {
    let nvar = params.len();
    let selected: Vec<usize> = (0..nvar).filter(|&j| Some(j) != const_loc).collect();
    if selected.is_empty() {
        return TestStatistic::invalid("model contains no non-constant regressors");
    }
    let df = selected.len();
    let restricted_params = params.select_rows(selected.iter());
    let restricted_cov = cov.select_rows(selected.iter()).select_columns(selected.iter());
    let Ok(cov_inv) = inverse(&restricted_cov, "restricted parameter covariance") else {
        return TestStatistic::invalid("parameter covariance is singular");
    };
    let stat = restricted_params.dot(&(cov_inv * &restricted_params));
    if !stat.is_finite() {
        return TestStatistic::invalid("test statistic is not finite");
    }
    let null = "All parameters ex. constant are zero";
    if debiased {
        TestStatistic::Valid(WaldTest::new(
            stat / df as f64,
            df,
            Some(nobs.saturating_sub(nvar)),
            null,
        ))
    } else {
        TestStatistic::Valid(WaldTest::new(stat, df, None, null))
    }
}

/// Hansen's J statistic `n · ḡ'Wḡ` with `ḡ = mean(z ⊙ ε)`.
///
/// Degrees of freedom equal the number of overidentifying restrictions.
pub fn j_statistic(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    params: &DVector<f64>,
    w: &DMatrix<f64>,
) -> WaldTest {
    let nobs = x.nrows();
    let eps = y - x * params;
    let g_bar = column_means(&scale_rows(z, &eps));
    let stat = nobs as f64 * g_bar.dot(&(w * &g_bar));
    let df = z.ncols().saturating_sub(x.ncols());
    WaldTest::new(stat, df, None, "Expected moment conditions are equal to 0")
}

/// Restricts cluster labels in a covariance configuration to the estimation sample.
pub fn align_cov_config(data: &ModelData, config: &CovarianceConfig) -> Result<CovarianceConfig> {
    let mut aligned = config.clone();
    if let Some(clusters) = &config.clusters {
        aligned.clusters = Some(data.align_to_sample(clusters, "cluster labels")?);
    }
    Ok(aligned)
}

/// Restricts cluster labels in a weight configuration to the estimation sample.
pub fn align_weight_config(data: &ModelData, config: &WeightConfig) -> Result<WeightConfig> {
    let mut aligned = config.clone();
    if let Some(clusters) = &config.clusters {
        aligned.clusters = Some(data.align_to_sample(clusters, "cluster labels")?);
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn f_statistic_excludes_constant() {
        let params = DVector::from_vec(vec![10.0, 2.0, -1.0]);
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.25, 1.0]));
        let stat = f_statistic(&params, &cov, false, 100, Some(0));
        let test = stat.as_valid().unwrap();
        assert_eq!(test.df, 2);
        assert_relative_eq!(test.stat, 16.0 + 1.0, epsilon = 1e-12);
        assert!(test.df_denom.is_none());

        let debiased = f_statistic(&params, &cov, true, 100, Some(0));
        let test = debiased.as_valid().unwrap();
        assert_relative_eq!(test.stat, 8.5, epsilon = 1e-12);
        assert_eq!(test.df_denom, Some(97));
    }

    #[test]
    fn f_statistic_is_invalid_without_regressors_or_covariance() {
        let params = DVector::from_vec(vec![1.0]);
        let cov = DMatrix::from_element(1, 1, 1.0);
        assert!(!f_statistic(&params, &cov, false, 10, Some(0)).is_valid());

        let params = DVector::from_vec(vec![1.0, 2.0]);
        let singular = DMatrix::zeros(2, 2);
        assert!(!f_statistic(&params, &singular, false, 10, None).is_valid());
    }

    #[test]
    fn j_statistic_is_zero_at_exact_solution() {
        // Exactly identified: z = x, so solving z'ε = 0 makes ḡ vanish.
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = DVector::from_vec(vec![1.0, 2.9, 5.2, 6.8]);
        let params = crate::linalg::pinv(&x).unwrap() * &y;
        let w = DMatrix::identity(2, 2);
        let j = j_statistic(&x, &y, &x, &params, &w);
        assert!(j.stat.abs() < 1e-16);
        assert_eq!(j.df, 0);
        assert!(j.pval.is_nan());
    }
}
