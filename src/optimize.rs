//! Pluggable minimization of smooth objectives, used by continuously-updating GMM.
//!
//! [`Lbfgs`] wraps argmin's L-BFGS with a More-Thuente line search. Gradients are
//! obtained by central differences since the CUE objective has no closed-form gradient.

use std::fmt;
use std::sync::Mutex;

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{IvError, Result};

/// Objective `f: ℝⁿ → ℝ` evaluated by a [`Minimizer`].
pub type Objective<'a> = dyn Fn(&[f64]) -> Result<f64> + 'a;

/// Settings shared by the minimizers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerOptions {
    /// Maximum number of solver iterations.
    pub max_iterations: u64,
    /// Stop when the gradient norm falls below this value.
    pub gradient_tolerance: f64,
    /// Stop when the objective changes by less than this value.
    pub cost_tolerance: f64,
    /// Number of correction pairs kept by L-BFGS.
    pub memory: usize,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            gradient_tolerance: 1e-6,
            cost_tolerance: 1e-12,
            memory: 10,
        }
    }
}

impl OptimizerOptions {
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    pub fn with_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.cost_tolerance = tolerance;
        self
    }
}

/// Outcome of a minimization.
#[derive(Clone, Debug, PartialEq)]
pub struct Minimum {
    /// Best point found.
    pub point: Vec<f64>,
    /// Objective value at `point`.
    pub value: f64,
    /// Iterations performed by the solver.
    pub iterations: u64,
    /// Whether the solver reported convergence.
    pub converged: bool,
    /// Termination message.
    pub message: String,
}

impl fmt::Display for Minimum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "value={:.6e}, iterations={}, converged={} ({})",
            self.value, self.iterations, self.converged, self.message
        )
    }
}

/// Unconstrained minimization capability.
pub trait Minimizer {
    /// Minimizes `objective` starting from `start`.
    ///
    /// Failing to converge is not an error: implementations return the best point
    /// found with `converged = false`.
    fn minimize(&self, objective: &Objective<'_>, start: &[f64]) -> Result<Minimum>;
}

/// L-BFGS minimizer backed by argmin.
#[derive(Clone, Debug, Default)]
pub struct Lbfgs {
    options: OptimizerOptions,
}

impl Lbfgs {
    pub fn new(options: OptimizerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }
}

/// Adapter exposing an [`Objective`] to argmin and recording the best evaluation.
struct ArgminProblem<'a, 'b> {
    objective: &'a Objective<'b>,
    best: &'a Mutex<(Vec<f64>, f64)>,
}

impl ArgminProblem<'_, '_> {
    fn eval(&self, params: &[f64]) -> std::result::Result<f64, argmin::core::Error> {
        let value = (self.objective)(params).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        if let Ok(mut best) = self.best.lock() {
            if value.is_finite() && value < best.1 {
                *best = (params.to_vec(), value);
            }
        }
        Ok(value)
    }
}

impl CostFunction for ArgminProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.eval(params)
    }
}

impl Gradient for ArgminProblem<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let mut shifted = params.clone();
        let mut grad = Vec::with_capacity(params.len());
        for i in 0..params.len() {
            let h = 1e-6 * params[i].abs().max(1.0);
            shifted[i] = params[i] + h;
            let up = (self.objective)(&shifted).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
            shifted[i] = params[i] - h;
            let down =
                (self.objective)(&shifted).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
            shifted[i] = params[i];
            grad.push((up - down) / (2.0 * h));
        }
        Ok(grad)
    }
}

impl Minimizer for Lbfgs {
    fn minimize(&self, objective: &Objective<'_>, start: &[f64]) -> Result<Minimum> {
        if start.is_empty() {
            return Err(IvError::InvalidStartingValues {
                expected: 1,
                found: 0,
            });
        }
        let initial = objective(start)?;
        if !initial.is_finite() {
            return Err(IvError::Optimization {
                message: format!("objective is not finite at the starting point ({initial})"),
            });
        }
        let best = Mutex::new((start.to_vec(), initial));

        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, self.options.memory)
            .with_tolerance_grad(self.options.gradient_tolerance)
            .and_then(|solver| solver.with_tolerance_cost(self.options.cost_tolerance))
            .map_err(|e| IvError::invalid_config(format!("optimizer tolerance: {e}")))?;

        let problem = ArgminProblem {
            objective,
            best: &best,
        };
        let run = Executor::new(problem, solver)
            .configure(|state| state.param(start.to_vec()).max_iters(self.options.max_iterations))
            .run();

        match run {
            Ok(res) => {
                let state = res.state();
                let termination = state.get_termination_status();
                let converged = matches!(
                    termination,
                    TerminationStatus::Terminated(TerminationReason::SolverConverged)
                );
                let message = termination.to_string();
                let iterations = state.get_iter();
                let (point, value) = match state.get_best_param() {
                    Some(point) => (point.clone(), state.get_best_cost()),
                    None => (start.to_vec(), initial),
                };
                if !converged {
                    warn!("minimizer stopped without converging: {message}");
                }
                Ok(Minimum {
                    point,
                    value,
                    iterations,
                    converged,
                    message,
                })
            }
            Err(err) => {
                warn!("minimizer failed, returning the best point evaluated: {err}");
                let (point, value) = best
                    .lock()
                    .map(|best| best.clone())
                    .unwrap_or_else(|_| (start.to_vec(), initial));
                Ok(Minimum {
                    point,
                    value,
                    iterations: 0,
                    converged: false,
                    message: err.to_string(),
                })
            }
        }
    }
}
