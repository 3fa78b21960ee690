//! Instrumental-variable regression for linear models.
//!
//! This crate estimates linear models with endogenous regressors using
//!
//! - the k-class family: OLS, two-stage least squares and LIML with Fuller's
//!   modification (`kclass` module),
//! - two-step and iterated efficient GMM (`gmm` module), and
//! - continuously-updating GMM, minimized numerically (`cue` module).
//!
//! Every estimator works on a validated [`ModelData`] value, shares the same
//! post-estimation path (residuals, R², F and J statistics) and plugs in one of the
//! parameter covariance strategies from the `covariance` module (homoskedastic,
//! heteroskedasticity-robust, kernel/HAC and one-way clustered). GMM weight matrices are
//! selected from the same set of keys through the `weighting` module.
//!
//! # Quick start
//!
//! ```no_run
//! use ivrs::{CovarianceOptions, CovarianceType, IvEstimator, KClassEstimator, ModelDataBuilder};
//! use nalgebra::{DMatrix, DVector};
//!
//! let y = DVector::from_vec(vec![3.1, 4.2, 5.9, 6.8, 8.1, 9.0]);
//! let exog = DMatrix::from_element(6, 1, 1.0);
//! let endog = DMatrix::from_column_slice(6, 1, &[0.8, 1.5, 2.6, 3.1, 4.0, 4.4]);
//! let instruments = DMatrix::from_column_slice(6, 2, &[
//!     0.5, 1.1, 2.0, 2.4, 3.3, 3.9,
//!     1.0, 0.2, -0.3, 0.8, 0.1, -0.6,
//! ]);
//!
//! let data = ModelDataBuilder::new(y)
//!     .exog(exog)
//!     .endog(endog)
//!     .instruments(instruments)
//!     .build()
//!     .expect("validated model data");
//!
//! let results = KClassEstimator::two_stage(&data)
//!     .fit(&CovarianceOptions::new(CovarianceType::Robust))
//!     .expect("estimated");
//! println!("{}: {:?} (se {:?})", results.method, results.params, results.std_errors());
//! ```
//!
//! GMM estimators are built the same way:
//!
//! ```no_run
//! # use ivrs::{IvEstimator, ModelData};
//! # fn run(data: &ModelData) -> ivrs::Result<()> {
//! use ivrs::{GmmEstimator, GmmOptions, WeightConfig, WeightType};
//!
//! let gmm = GmmEstimator::new(data, WeightType::Robust, WeightConfig::default())?;
//! let results = gmm.fit(&GmmOptions::default())?;
//! let j = &results.gmm.as_ref().expect("GMM diagnostics").j_stat;
//! println!("J = {:.3} (p = {:.3})", j.stat, j.pval);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod covariance;
pub mod cue;
pub mod data;
pub mod error;
pub mod estimation;
pub mod gmm;
pub mod kclass;
pub mod kernel;
pub mod linalg;
pub mod optimize;
pub mod options;
pub mod results;
pub mod simulation;
pub mod weighting;

pub use covariance::{CovarianceConfig, CovarianceEstimator, CovarianceType, WeightType};
pub use cue::CueGmmEstimator;
pub use data::{ModelData, ModelDataBuilder};
pub use error::{IvError, Result};
pub use estimation::IvEstimator;
pub use gmm::{estimate_gmm_parameters, GmmEstimator};
pub use kclass::{estimate_kclass_parameters, KClassEstimator};
pub use kernel::KernelType;
pub use optimize::{Lbfgs, Minimizer, Minimum, OptimizerOptions};
pub use options::{CovarianceOptions, CueOptions, GmmOptions, LimlOptions, WeightingMatrix};
pub use results::{IvResults, ResultKind, TestStatistic, WaldTest};
pub use weighting::{WeightConfig, WeightMatrixEstimator};
