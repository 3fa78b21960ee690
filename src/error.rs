use thiserror::Error;

/// Unified error type for `ivrs` operations.
#[derive(Debug, Error)]
pub enum IvError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when neither exogenous nor endogenous regressors were supplied.
    #[error("model must contain at least one regressor")]
    NoRegressors,

    /// Raised when there are fewer excluded instruments than endogenous regressors.
    #[error(
        "the number of instruments ({instruments}) must be at least as large as the number of endogenous regressors ({endogenous})"
    )]
    UnderIdentified { instruments: usize, endogenous: usize },

    /// Raised when a design matrix does not have full column rank.
    #[error("{matrix} do not have full column rank (rank {rank} < {columns})")]
    RankDeficient {
        /// Which block failed, e.g. `regressors [exog endog]`.
        matrix: &'static str,
        rank: usize,
        columns: usize,
    },

    /// Raised when an observation weight is zero or negative.
    #[error("weights must be strictly positive, found {weight} at index {index}")]
    NonPositiveWeight { index: usize, weight: f64 },

    /// Raised when every observation contains at least one missing value.
    #[error("all observations contain missing data; model cannot be estimated")]
    AllRowsMissing,

    /// Raised when a covariance or weight-matrix key is not recognized.
    #[error("unknown covariance type `{key}`")]
    UnknownCovarianceType { key: String },

    /// Raised when a kernel name is not recognized.
    #[error("unknown kernel `{key}`")]
    UnknownKernel { key: String },

    /// Raised when a strategy configuration is incomplete or inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Raised when user-supplied starting values have the wrong length.
    #[error("starting values must have {expected} elements, found {found}")]
    InvalidStartingValues { expected: usize, found: usize },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when numerical routines produce NaN.
    #[error("encountered NaN during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the numerical optimizer could not be set up or run.
    #[error("optimization failed: {message}")]
    Optimization { message: String },
}

impl IvError {
    /// Helper to format a [`DimensionMismatch`](IvError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper for configuration problems detected while building a strategy.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, IvError>;
