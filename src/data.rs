//! Model data containers and the validation that every estimator relies on.
//!
//! [`ModelData`] owns the cleaned dependent variable, regressor blocks and
//! instruments together with their weight-scaled copies (`√w · value`). It is built
//! once through [`ModelDataBuilder`] and then shared read-only by the k-class, GMM
//! and CUE estimators.

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::error::{IvError, Result};
use crate::linalg::{has_constant, hstack, matrix_rank, scale_rows};

/// Validated instrumental-variable model data.
#[derive(Clone, Debug)]
pub struct ModelData {
    dependent: DVector<f64>,
    exog: DMatrix<f64>,
    endog: DMatrix<f64>,
    instruments: DMatrix<f64>,
    weights: DVector<f64>,
    sqrt_weights: DVector<f64>,
    x: DMatrix<f64>,
    z: DMatrix<f64>,
    wy: DVector<f64>,
    wx: DMatrix<f64>,
    wz: DMatrix<f64>,
    dependent_name: String,
    regressor_names: Vec<String>,
    instrument_names: Vec<String>,
    index: Vec<usize>,
    isnull: Vec<bool>,
    has_constant: bool,
    const_loc: Option<usize>,
}

impl ModelData {
    /// Creates model data from the four blocks with unit weights.
    pub fn new(
        dependent: DVector<f64>,
        exog: DMatrix<f64>,
        endog: DMatrix<f64>,
        instruments: DMatrix<f64>,
    ) -> Result<Self> {
        ModelDataBuilder::new(dependent)
            .exog(exog)
            .endog(endog)
            .instruments(instruments)
            .build()
    }

    /// Number of observations used in estimation.
    pub fn nobs(&self) -> usize {
        self.dependent.len()
    }

    /// Number of rows supplied before missing values were dropped.
    pub fn original_nobs(&self) -> usize {
        self.isnull.len()
    }

    /// Number of exogenous regressors.
    pub fn n_exog(&self) -> usize {
        self.exog.ncols()
    }

    /// Number of endogenous regressors.
    pub fn n_endog(&self) -> usize {
        self.endog.ncols()
    }

    /// Number of excluded instruments.
    pub fn n_instruments(&self) -> usize {
        self.instruments.ncols()
    }

    /// Number of regressors in `x = [exog endog]`.
    pub fn nvar(&self) -> usize {
        self.x.ncols()
    }

    pub fn dependent(&self) -> &DVector<f64> {
        &self.dependent
    }

    pub fn exog(&self) -> &DMatrix<f64> {
        &self.exog
    }

    pub fn endog(&self) -> &DMatrix<f64> {
        &self.endog
    }

    pub fn instruments(&self) -> &DMatrix<f64> {
        &self.instruments
    }

    /// Observation weights, normalized to have mean one.
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    pub fn sqrt_weights(&self) -> &DVector<f64> {
        &self.sqrt_weights
    }

    /// Regressor matrix `[exog endog]`.
    pub fn x(&self) -> &DMatrix<f64> {
        &self.x
    }

    /// First-stage regressors `[exog instruments]`.
    pub fn z(&self) -> &DMatrix<f64> {
        &self.z
    }

    /// Weighted dependent variable.
    pub fn wy(&self) -> &DVector<f64> {
        &self.wy
    }

    /// Weighted regressors.
    pub fn wx(&self) -> &DMatrix<f64> {
        &self.wx
    }

    /// Weighted first-stage regressors.
    pub fn wz(&self) -> &DMatrix<f64> {
        &self.wz
    }

    /// Weighted exogenous regressors (the leading columns of `wx`).
    pub fn wx_exog(&self) -> DMatrix<f64> {
        self.wx.columns(0, self.n_exog()).into_owned()
    }

    /// Weighted endogenous regressors (the trailing columns of `wx`).
    pub fn wx_endog(&self) -> DMatrix<f64> {
        self.wx.columns(self.n_exog(), self.n_endog()).into_owned()
    }

    pub fn dependent_name(&self) -> &str {
        &self.dependent_name
    }

    /// Names of the columns of `x`.
    pub fn regressor_names(&self) -> &[String] {
        &self.regressor_names
    }

    /// Names of the columns of `z`.
    pub fn instrument_names(&self) -> &[String] {
        &self.instrument_names
    }

    /// Positions of the retained observations in the supplied data.
    pub fn index(&self) -> &[usize] {
        &self.index
    }

    /// Mask of supplied rows that were dropped because of missing values.
    pub fn isnull(&self) -> &[bool] {
        &self.isnull
    }

    /// Mask of supplied rows that were used in estimation.
    pub fn notnull(&self) -> Vec<bool> {
        self.isnull.iter().map(|missing| !missing).collect()
    }

    /// Whether `x` contains an explicit or implied constant.
    pub fn has_constant(&self) -> bool {
        self.has_constant
    }

    pub fn const_loc(&self) -> Option<usize> {
        self.const_loc
    }

    /// Model residuals `y - x·params`.
    pub fn resids(&self, params: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_params(params)?;
        Ok(&self.dependent - &self.x * params)
    }

    /// Weighted residuals `wy - wx·params`. Identical to [`resids`](Self::resids) under unit weights.
    pub fn weighted_resids(&self, params: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_params(params)?;
        Ok(&self.wy - &self.wx * params)
    }

    /// Fitted values `[exog endog]·params` for new data laid out like the model regressors.
    pub fn predict(
        &self,
        params: &DVector<f64>,
        exog: &DMatrix<f64>,
        endog: &DMatrix<f64>,
    ) -> Result<DVector<f64>> {
        self.check_params(params)?;
        if exog.ncols() != self.n_exog() {
            return Err(IvError::dimension_mismatch(
                "exog columns",
                self.n_exog(),
                exog.ncols(),
            ));
        }
        if endog.ncols() != self.n_endog() {
            return Err(IvError::dimension_mismatch(
                "endog columns",
                self.n_endog(),
                endog.ncols(),
            ));
        }
        if exog.nrows() != endog.nrows() && self.n_exog() > 0 && self.n_endog() > 0 {
            return Err(IvError::dimension_mismatch(
                "endog rows",
                exog.nrows(),
                endog.nrows(),
            ));
        }
        let rows = if self.n_exog() > 0 {
            exog.nrows()
        } else {
            endog.nrows()
        };
        let exog = if exog.ncols() == 0 {
            DMatrix::zeros(rows, 0)
        } else {
            exog.clone()
        };
        let endog = if endog.ncols() == 0 {
            DMatrix::zeros(rows, 0)
        } else {
            endog.clone()
        };
        Ok(hstack(&exog, &endog) * params)
    }

    /// Restricts per-observation side data (e.g. cluster labels) to the estimation sample.
    ///
    /// Accepts values for every supplied row, which are subset with the missing-value
    /// mask, or values already aligned with the retained rows.
    pub fn align_to_sample<T: Clone>(&self, values: &[T], context: &'static str) -> Result<Vec<T>> {
        if values.len() == self.nobs() {
            return Ok(values.to_vec());
        }
        if values.len() == self.original_nobs() {
            return Ok(self.index.iter().map(|&i| values[i].clone()).collect());
        }
        Err(IvError::dimension_mismatch(context, self.nobs(), values.len()))
    }

    fn check_params(&self, params: &DVector<f64>) -> Result<()> {
        if params.len() != self.nvar() {
            return Err(IvError::dimension_mismatch(
                "parameter length",
                self.nvar(),
                params.len(),
            ));
        }
        Ok(())
    }
}

/// Builder that validates dimensions, weights and identification before constructing [`ModelData`].
#[derive(Debug)]
pub struct ModelDataBuilder {
    dependent: DVector<f64>,
    exog: Option<DMatrix<f64>>,
    endog: Option<DMatrix<f64>>,
    instruments: Option<DMatrix<f64>>,
    weights: Option<DVector<f64>>,
    dependent_name: Option<String>,
    exog_names: Option<Vec<String>>,
    endog_names: Option<Vec<String>>,
    instrument_names: Option<Vec<String>>,
}

impl ModelDataBuilder {
    /// Start building model data from the dependent variable.
    pub fn new(dependent: DVector<f64>) -> Self {
        Self {
            dependent,
            exog: None,
            endog: None,
            instruments: None,
            weights: None,
            dependent_name: None,
            exog_names: None,
            endog_names: None,
            instrument_names: None,
        }
    }

    /// Sets the exogenous regressors.
    pub fn exog(mut self, matrix: DMatrix<f64>) -> Self {
        self.exog = Some(matrix);
        self
    }

    /// Sets the endogenous regressors.
    pub fn endog(mut self, matrix: DMatrix<f64>) -> Self {
        self.endog = Some(matrix);
        self
    }

    /// Sets the excluded instruments.
    pub fn instruments(mut self, matrix: DMatrix<f64>) -> Self {
        self.instruments = Some(matrix);
        self
    }

    /// Sets strictly positive observation weights.
    pub fn weights(mut self, weights: DVector<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn dependent_name(mut self, name: impl Into<String>) -> Self {
        self.dependent_name = Some(name.into());
        self
    }

    pub fn exog_names(mut self, names: Vec<String>) -> Self {
        self.exog_names = Some(names);
        self
    }

    pub fn endog_names(mut self, names: Vec<String>) -> Self {
        self.endog_names = Some(names);
        self
    }

    pub fn instrument_names(mut self, names: Vec<String>) -> Self {
        self.instrument_names = Some(names);
        self
    }

    /// Finalizes construction after validating shapes, weights, missing values and rank.
    pub fn build(self) -> Result<ModelData> {
        let n = self.dependent.len();
        if n == 0 {
            return Err(IvError::dimension_mismatch("dependent rows", 1, 0));
        }

        let exog = block_or_empty(self.exog, n, "exog rows")?;
        let endog = block_or_empty(self.endog, n, "endog rows")?;
        let instruments = block_or_empty(self.instruments, n, "instruments rows")?;
        let weights = self.weights.unwrap_or_else(|| DVector::from_element(n, 1.0));
        if weights.len() != n {
            return Err(IvError::dimension_mismatch("weights length", n, weights.len()));
        }

        let exog_names = names_or_default(self.exog_names, &exog, "exog", "exog names")?;
        let endog_names = names_or_default(self.endog_names, &endog, "endog", "endog names")?;
        let instr_names = names_or_default(
            self.instrument_names,
            &instruments,
            "instruments",
            "instrument names",
        )?;

        for (index, weight) in weights.iter().enumerate() {
            if *weight <= 0.0 {
                return Err(IvError::NonPositiveWeight {
                    index,
                    weight: *weight,
                });
            }
        }

        let isnull: Vec<bool> = (0..n)
            .map(|i| {
                self.dependent[i].is_nan()
                    || weights[i].is_nan()
                    || row_has_nan(&exog, i)
                    || row_has_nan(&endog, i)
                    || row_has_nan(&instruments, i)
            })
            .collect();
        let index: Vec<usize> = (0..n).filter(|&i| !isnull[i]).collect();
        if index.is_empty() {
            return Err(IvError::AllRowsMissing);
        }
        let dropped = n - index.len();
        if dropped > 0 {
            warn!("{dropped} observation(s) dropped because of missing values");
        }

        let (dependent, exog, endog, instruments, weights) = if dropped > 0 {
            (
                self.dependent.select_rows(index.iter()),
                exog.select_rows(index.iter()),
                endog.select_rows(index.iter()),
                instruments.select_rows(index.iter()),
                weights.select_rows(index.iter()),
            )
        } else {
            (self.dependent, exog, endog, instruments, weights)
        };

        let mean_weight = weights.sum() / weights.len() as f64;
        let weights = weights / mean_weight;
        let sqrt_weights = weights.map(f64::sqrt);

        let x = hstack(&exog, &endog);
        let z = hstack(&exog, &instruments);
        let wy = dependent.component_mul(&sqrt_weights);
        let wx = scale_rows(&x, &sqrt_weights);
        let wz = scale_rows(&z, &sqrt_weights);

        if x.ncols() == 0 {
            return Err(IvError::NoRegressors);
        }
        if instruments.ncols() < endog.ncols() {
            return Err(IvError::UnderIdentified {
                instruments: instruments.ncols(),
                endogenous: endog.ncols(),
            });
        }
        let x_rank = matrix_rank(&x);
        if x_rank < x.ncols() {
            return Err(IvError::RankDeficient {
                matrix: "regressors [exog endog]",
                rank: x_rank,
                columns: x.ncols(),
            });
        }
        let z_rank = matrix_rank(&z);
        if z_rank < z.ncols() {
            return Err(IvError::RankDeficient {
                matrix: "instruments [exog instruments]",
                rank: z_rank,
                columns: z.ncols(),
            });
        }
        let (has_constant, const_loc) = has_constant(&x);

        let regressor_names = exog_names.iter().chain(endog_names.iter()).cloned().collect();
        let instrument_names = exog_names.iter().chain(instr_names.iter()).cloned().collect();

        Ok(ModelData {
            dependent,
            exog,
            endog,
            instruments,
            weights,
            sqrt_weights,
            x,
            z,
            wy,
            wx,
            wz,
            dependent_name: self.dependent_name.unwrap_or_else(|| "dependent".to_string()),
            regressor_names,
            instrument_names,
            index,
            isnull,
            has_constant,
            const_loc,
        })
    }
}

fn block_or_empty(
    block: Option<DMatrix<f64>>,
    n: usize,
    context: &'static str,
) -> Result<DMatrix<f64>> {
    match block {
        // A block without columns carries no information, so its row count is irrelevant.
        Some(matrix) if matrix.ncols() == 0 => Ok(DMatrix::zeros(n, 0)),
        Some(matrix) if matrix.nrows() != n => {
            Err(IvError::dimension_mismatch(context, n, matrix.nrows()))
        }
        Some(matrix) => Ok(matrix),
        None => Ok(DMatrix::zeros(n, 0)),
    }
}

fn names_or_default(
    names: Option<Vec<String>>,
    block: &DMatrix<f64>,
    prefix: &str,
    context: &'static str,
) -> Result<Vec<String>> {
    let k = block.ncols();
    match names {
        Some(names) if names.len() != k => Err(IvError::dimension_mismatch(context, k, names.len())),
        Some(names) => Ok(names),
        None if k == 1 => Ok(vec![prefix.to_string()]),
        None => Ok((0..k).map(|j| format!("{prefix}.{j}")).collect()),
    }
}

fn row_has_nan(matrix: &DMatrix<f64>, row: usize) -> bool {
    matrix.row(row).iter().any(|v| v.is_nan())
}
