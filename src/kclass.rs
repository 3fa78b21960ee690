//! k-class estimators: OLS (κ = 0), 2SLS (κ = 1) and LIML with Fuller's modification.
//!
//! All members share the closed form
//!
//! ```text
//! β = [(1-κ) x'x + κ x'z pinv(z) x]⁻¹ [(1-κ) x'y + κ x'z pinv(z) y]
//! ```
//!
//! LIML picks κ as the smallest root of `|W'M_x1 W - κ W'M_z W| = 0` with `W = [y endog]`.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::covariance::{kclass_covariance, CovarianceInputs};
use crate::data::ModelData;
use crate::error::{IvError, Result};
use crate::estimation::{align_cov_config, post_estimation, IvEstimator};
use crate::linalg::{hstack, inv_sqrth, inverse, min_eigenvalue, pinv};
use crate::options::{CovarianceOptions, LimlOptions};
use crate::results::{IvResults, KClassDiagnostics, ResultKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KClassMethod {
    Ols,
    TwoStage,
    Liml,
}

/// k-class IV estimator.
#[derive(Clone, Debug)]
pub struct KClassEstimator<'a> {
    data: &'a ModelData,
    method: KClassMethod,
    options: LimlOptions,
}

impl<'a> KClassEstimator<'a> {
    /// LIML, optionally with Fuller's α or an explicit κ.
    pub fn liml(data: &'a ModelData, options: LimlOptions) -> Self {
        if options.kappa.is_some() && options.fuller != 0.0 {
            warn!(
                "kappa and fuller should not normally be used simultaneously; \
                 the explicit kappa is used and fuller is ignored"
            );
        }
        Self {
            data,
            method: KClassMethod::Liml,
            options,
        }
    }

    /// Two-stage least squares.
    pub fn two_stage(data: &'a ModelData) -> Self {
        Self {
            data,
            method: KClassMethod::TwoStage,
            options: LimlOptions::default().with_kappa(1.0),
        }
    }

    /// Least squares of `y` on `x`, treating every regressor as exogenous.
    pub fn ols(data: &'a ModelData) -> Self {
        Self {
            data,
            method: KClassMethod::Ols,
            options: LimlOptions::default().with_kappa(0.0),
        }
    }

    pub fn options(&self) -> &LimlOptions {
        &self.options
    }

    /// LIML κ estimated from the data.
    pub fn estimate_kappa(&self) -> Result<f64> {
        let data = self.data;
        estimate_liml_kappa(data.wy(), &data.wx_exog(), &data.wx_endog(), data.wz())
    }

    /// κ used in estimation together with the LIML κ reported for reference.
    pub fn resolve_kappa(&self) -> Result<(f64, Option<f64>)> {
        match (self.method, self.options.kappa) {
            (KClassMethod::Ols, _) => Ok((0.0, None)),
            (_, Some(kappa)) => Ok((kappa, self.estimate_kappa().ok())),
            (_, None) => {
                let (nobs, ninstr) = self.data.wz().shape();
                if self.options.fuller != 0.0 && nobs <= ninstr {
                    return Err(IvError::invalid_config(format!(
                        "fuller adjustment requires more observations ({nobs}) than instruments ({ninstr})"
                    )));
                }
                let liml_kappa = self.estimate_kappa()?;
                let mut kappa = liml_kappa;
                if self.options.fuller != 0.0 {
                    kappa -= self.options.fuller / (nobs - ninstr) as f64;
                }
                debug!("LIML kappa {liml_kappa:.8}, used kappa {kappa:.8}");
                Ok((kappa, Some(liml_kappa)))
            }
        }
    }

    /// Instruments used by the estimator; OLS instruments every regressor with itself.
    fn instruments(&self) -> &DMatrix<f64> {
        match self.method {
            KClassMethod::Ols => self.data.wx(),
            _ => self.data.wz(),
        }
    }

    fn is_ols(&self) -> bool {
        self.method == KClassMethod::Ols
            || (self.data.n_endog() == 0 && self.data.n_instruments() == 0)
    }
}

impl IvEstimator for KClassEstimator<'_> {
    type Options = CovarianceOptions;

    fn data(&self) -> &ModelData {
        self.data
    }

    fn method(&self) -> String {
        if self.is_ols() {
            return "OLS".to_string();
        }
        match self.method {
            KClassMethod::TwoStage => "IV-2SLS".to_string(),
            _ => {
                let mut additional = Vec::new();
                if self.options.fuller != 0.0 {
                    additional.push(format!("fuller(alpha={})", self.options.fuller));
                }
                if let Some(kappa) = self.options.kappa {
                    additional.push(format!("kappa={kappa}"));
                }
                if additional.is_empty() {
                    "IV-LIML".to_string()
                } else {
                    format!("IV-LIML({})", additional.join(", "))
                }
            }
        }
    }

    fn fit(&self, options: &CovarianceOptions) -> Result<IvResults> {
        let data = self.data;
        let (kappa, liml_kappa) = self.resolve_kappa()?;
        let z = self.instruments();
        let params = estimate_kclass_parameters(data.wx(), data.wy(), z, kappa)?;

        let config = align_cov_config(data, &options.config)?;
        let inputs = CovarianceInputs {
            x: data.wx(),
            y: data.wy(),
            z,
            params: &params,
            kappa,
        };
        let covariance = kclass_covariance(options.cov_type, inputs, options.debiased, &config)?;

        let kind = if self.is_ols() {
            ResultKind::Ols
        } else {
            ResultKind::Iv
        };
        let mut results = post_estimation(
            data,
            kind,
            self.method(),
            params,
            options.cov_type,
            covariance.as_ref(),
        )?;
        results.kclass = Some(KClassDiagnostics {
            kappa,
            liml_kappa,
            fuller: self.options.fuller,
        });
        Ok(results)
    }
}

/// LIML κ: the smallest eigenvalue of `(ez'ez)^{-1/2} (ex1'ex1) (ez'ez)^{-1/2}`.
///
/// `ez` and `ex1` are the residuals of `[y endog]` after projecting on `z` and on the
/// exogenous regressors respectively.
pub fn estimate_liml_kappa(
    y: &DVector<f64>,
    exog: &DMatrix<f64>,
    endog: &DMatrix<f64>,
    z: &DMatrix<f64>,
) -> Result<f64> {
    let n = y.len();
    if endog.nrows() != n || z.nrows() != n || (exog.ncols() > 0 && exog.nrows() != n) {
        return Err(IvError::dimension_mismatch("kappa data rows", n, z.nrows()));
    }
    let e = hstack(&DMatrix::from_column_slice(n, 1, y.as_slice()), endog);
    let ez = &e - z * (pinv(z)? * &e);
    let ex1 = if exog.ncols() == 0 {
        e
    } else {
        &e - exog * (pinv(exog)? * &e)
    };
    let ez_sqinv = inv_sqrth(&(ez.transpose() * &ez), "residual cross-product e'M_z e")?;
    let q = &ez_sqinv * (ex1.transpose() * &ex1) * &ez_sqinv;
    min_eigenvalue(&q)
}

/// Closed-form k-class estimate for weighted data.
///
/// `kappa = 1` gives 2SLS and `kappa = 0` gives OLS.
pub fn estimate_kclass_parameters(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    kappa: f64,
) -> Result<DVector<f64>> {
    let n = x.nrows();
    if y.len() != n {
        return Err(IvError::dimension_mismatch("dependent rows", n, y.len()));
    }
    if z.nrows() != n {
        return Err(IvError::dimension_mismatch("instrument rows", n, z.nrows()));
    }
    let pinv_z = pinv(z)?;
    let xpz = x.transpose() * z;
    let p1 = (x.transpose() * x) * (1.0 - kappa) + (&xpz * (&pinv_z * x)) * kappa;
    let p2 = (x.transpose() * y) * (1.0 - kappa) + (&xpz * (&pinv_z * y)) * kappa;
    Ok(inverse(&p1, "k-class normal equations")? * p2)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::simulation::{SimulatedIvData, SimulationConfig};

    fn simulated(n_instruments: usize) -> ModelData {
        SimulatedIvData::generate(&SimulationConfig::default().with_n_instruments(n_instruments))
            .unwrap()
            .model_data()
            .unwrap()
    }

    #[test]
    fn kappa_zero_is_ols_and_one_is_2sls() {
        let data = simulated(2);
        let (x, y, z) = (data.wx(), data.wy(), data.wz());

        let ols = estimate_kclass_parameters(x, y, z, 0.0).unwrap();
        assert_relative_eq!(ols, pinv(x).unwrap() * y, epsilon = 1e-10);

        let tsls = estimate_kclass_parameters(x, y, z, 1.0).unwrap();
        let xhat = z * (pinv(z).unwrap() * x);
        let expected = inverse(&(xhat.transpose() * x), "test").unwrap() * (xhat.transpose() * y);
        assert_relative_eq!(tsls, expected, epsilon = 1e-10);
    }

    #[test]
    fn liml_kappa_is_one_when_exactly_identified() {
        let data = simulated(1);
        let kappa = KClassEstimator::liml(&data, LimlOptions::default())
            .estimate_kappa()
            .unwrap();
        assert_relative_eq!(kappa, 1.0, epsilon = 1e-8);

        let over = simulated(3);
        let kappa = KClassEstimator::liml(&over, LimlOptions::default())
            .estimate_kappa()
            .unwrap();
        assert!(kappa >= 1.0 - 1e-10);
    }

    #[test]
    fn fuller_shifts_kappa() {
        let data = simulated(3);
        let plain = KClassEstimator::liml(&data, LimlOptions::default());
        let fuller = KClassEstimator::liml(&data, LimlOptions::default().with_fuller(1.0));
        let (k_plain, _) = plain.resolve_kappa().unwrap();
        let (k_fuller, liml) = fuller.resolve_kappa().unwrap();
        assert_relative_eq!(k_plain, liml.unwrap(), epsilon = 1e-12);
        assert_relative_eq!(k_fuller, k_plain - 1.0 / (500.0 - 4.0), epsilon = 1e-12);
        assert_eq!(fuller.method(), "IV-LIML(fuller(alpha=1))");
    }

    #[test]
    fn fuller_rejects_saturated_instruments() {
        let y = DVector::from_vec(vec![1.0, 2.5, 2.0, 4.5]);
        let exog = DMatrix::from_element(4, 1, 1.0);
        let endog = DMatrix::from_column_slice(4, 1, &[0.3, 1.1, 0.9, 2.2]);
        let instruments = DMatrix::from_column_slice(
            4,
            3,
            &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        );
        let data = ModelData::new(y, exog, endog, instruments).unwrap();
        assert_eq!(data.wz().shape(), (4, 4));

        let estimator = KClassEstimator::liml(&data, LimlOptions::default().with_fuller(1.0));
        assert!(matches!(
            estimator.fit(&CovarianceOptions::default()),
            Err(IvError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn explicit_kappa_overrides_fuller() {
        let data = simulated(2);
        let estimator =
            KClassEstimator::liml(&data, LimlOptions::default().with_fuller(4.0).with_kappa(0.5));
        let (kappa, liml) = estimator.resolve_kappa().unwrap();
        assert_eq!(kappa, 0.5);
        assert!(liml.is_some());
        assert_eq!(estimator.method(), "IV-LIML(fuller(alpha=4), kappa=0.5)");

        let results = estimator.fit(&CovarianceOptions::default()).unwrap();
        let expected = estimate_kclass_parameters(data.wx(), data.wy(), data.wz(), 0.5).unwrap();
        assert_relative_eq!(results.params, expected, epsilon = 1e-12);
    }

    #[test]
    fn labels_and_kinds() {
        let data = simulated(2);
        assert_eq!(KClassEstimator::two_stage(&data).method(), "IV-2SLS");
        assert_eq!(KClassEstimator::ols(&data).method(), "OLS");
        assert_eq!(
            KClassEstimator::liml(&data, LimlOptions::default()).method(),
            "IV-LIML"
        );

        let results = KClassEstimator::ols(&data)
            .fit(&CovarianceOptions::default())
            .unwrap();
        assert_eq!(results.kind, ResultKind::Ols);
        assert_relative_eq!(results.params, pinv(data.wx()).unwrap() * data.wy(), epsilon = 1e-10);

        let exog_only = ModelData::new(
            data.dependent().clone(),
            data.exog().clone(),
            DMatrix::zeros(data.nobs(), 0),
            DMatrix::zeros(data.nobs(), 0),
        )
        .unwrap();
        let liml = KClassEstimator::liml(&exog_only, LimlOptions::default());
        assert_eq!(liml.method(), "OLS");
        assert_eq!(
            liml.fit(&CovarianceOptions::default()).unwrap().kind,
            ResultKind::Ols
        );
    }
}
