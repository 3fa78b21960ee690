//! Pairs bootstrap for the closed-form estimators.
//!
//! Rows of the weighted data `(wx, wy, wz)` are resampled with replacement and the
//! estimator is re-run on each replication in parallel. Replication `r` draws from a
//! generator seeded with `seed + r`, so results do not depend on thread scheduling.

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::ModelData;
use crate::error::{IvError, Result};
use crate::linalg::{column_means, symmetrize};

/// Controls the bootstrap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapOptions {
    pub replications: usize,
    pub seed: u64,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            replications: 999,
            seed: 0,
        }
    }
}

impl BootstrapOptions {
    pub fn with_replications(mut self, replications: usize) -> Self {
        self.replications = replications;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Bootstrap replications and their covariance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    /// One row per replication.
    pub params: DMatrix<f64>,
    /// Covariance of the replications, divided by the number of replications.
    pub cov: DMatrix<f64>,
}

impl BootstrapSummary {
    pub fn std_errors(&self) -> DVector<f64> {
        self.cov.diagonal().map(f64::sqrt)
    }
}

/// Re-estimates `estimator(x, y, z)` on resampled rows of the weighted model data.
///
/// Any closed-form estimator fits, e.g.
/// `|x, y, z| estimate_kclass_parameters(x, y, z, 1.0)`.
pub fn pairs_bootstrap<F>(data: &ModelData, options: &BootstrapOptions, estimator: F) -> Result<BootstrapSummary>
where
    F: Fn(&DMatrix<f64>, &DVector<f64>, &DMatrix<f64>) -> Result<DVector<f64>> + Sync,
{
    if options.replications < 2 {
        return Err(IvError::invalid_config("bootstrap requires at least two replications"));
    }
    let (wx, wy, wz) = (data.wx(), data.wy(), data.wz());
    let nobs = data.nobs();
    let nvar = data.nvar();

    let draws: Vec<DVector<f64>> = (0..options.replications)
        .into_par_iter()
        .map(|r| {
            let mut rng = SmallRng::seed_from_u64(options.seed.wrapping_add(r as u64));
            let rows: Vec<usize> = (0..nobs).map(|_| rng.gen_range(0..nobs)).collect();
            let params = estimator(
                &wx.select_rows(rows.iter()),
                &wy.select_rows(rows.iter()),
                &wz.select_rows(rows.iter()),
            )?;
            if params.len() != nvar {
                return Err(IvError::dimension_mismatch("bootstrap parameters", nvar, params.len()));
            }
            Ok(params)
        })
        .collect::<Result<_>>()?;

    let params = DMatrix::from_fn(draws.len(), nvar, |r, j| draws[r][j]);
    let mut centered = params.clone();
    let mean = column_means(&params);
    for mut row in centered.row_iter_mut() {
        row -= mean.transpose();
    }
    let cov = symmetrize(&(centered.transpose() * &centered / draws.len() as f64));
    debug!("pairs bootstrap finished {} replications", draws.len());
    Ok(BootstrapSummary { params, cov })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::CovarianceType;
    use crate::estimation::IvEstimator;
    use crate::kclass::{estimate_kclass_parameters, KClassEstimator};
    use crate::options::CovarianceOptions;
    use crate::simulation::{SimulatedIvData, SimulationConfig};

    #[test]
    fn bootstrap_is_reproducible_and_close_to_robust() {
        let data = SimulatedIvData::generate(&SimulationConfig::default())
            .unwrap()
            .model_data()
            .unwrap();
        let options = BootstrapOptions::default().with_replications(200).with_seed(11);
        let tsls = |x: &DMatrix<f64>, y: &DVector<f64>, z: &DMatrix<f64>| {
            estimate_kclass_parameters(x, y, z, 1.0)
        };
        let first = pairs_bootstrap(&data, &options, tsls).unwrap();
        let second = pairs_bootstrap(&data, &options, tsls).unwrap();
        assert_eq!(first.params, second.params);
        assert_eq!(first.params.shape(), (200, 2));

        let robust = KClassEstimator::two_stage(&data)
            .fit(&CovarianceOptions::new(CovarianceType::Robust))
            .unwrap();
        let ratio = first.std_errors()[1] / robust.std_errors()[1];
        assert!(ratio > 0.6 && ratio < 1.6, "ratio {ratio}");
    }

    #[test]
    fn rejects_single_replication() {
        let data = SimulatedIvData::generate(&SimulationConfig::default().with_nobs(50))
            .unwrap()
            .model_data()
            .unwrap();
        let options = BootstrapOptions::default().with_replications(1);
        let result = pairs_bootstrap(&data, &options, |x, y, z| estimate_kclass_parameters(x, y, z, 1.0));
        assert!(result.is_err());
    }
}
