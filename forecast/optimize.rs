//! # Penalized Maximum-Likelihood Driver
//!
//! Both population models are fit the same way: the penalized mean negative
//! log-likelihood is minimized over the *logarithms* of the model parameters,
//! which keeps every parameter strictly positive without needing a bounded
//! optimizer. The minimizer is BFGS with a Wolfe line search from the
//! `wolfe_bfgs` crate. Gradients are central finite differences of the
//! objective; each model has at most four parameters, so this costs eight
//! extra likelihood sweeps per gradient.
//!
//! A run that stops early (iteration cap, failed line search) is not an error
//! here. The best point the optimizer evaluated is returned together with a
//! [`FitReport`] whose `converged` flag is false, and callers that need a
//! converged fit turn that into a [`ConvergenceError`].

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Log-parameters are clamped to this magnitude before every evaluation.
const LOG_PARAM_BOUND: f64 = 20.0;

/// Cost handed to the line search in place of a non-finite objective.
const NON_FINITE_COST: f64 = 1e10;

/// Relative step for the central-difference gradient.
const GRADIENT_STEP: f64 = 1e-6;

/// Stopping rules for one optimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerOptions {
    /// Maximum number of BFGS iterations.
    pub max_iterations: usize,
    /// Convergence tolerance on the gradient norm.
    pub tolerance: f64,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-5,
        }
    }
}

impl OptimizerOptions {
    pub fn validate(&self) -> Result<(), OptimizeError> {
        if self.max_iterations == 0 {
            return Err(OptimizeError::InvalidOptions(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(OptimizeError::InvalidOptions(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// How an optimizer run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitReport {
    /// True when BFGS met its gradient tolerance.
    pub converged: bool,
    /// BFGS iterations, when the optimizer reported them.
    pub iterations: Option<usize>,
    /// Number of objective evaluations, gradient steps excluded.
    pub evaluations: usize,
    /// Penalized mean negative log-likelihood at the returned point.
    pub objective: f64,
    /// Why the optimizer stopped early, if it did.
    pub message: Option<String>,
}

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Initial objective is not finite: {0}. Cannot start BFGS optimization.")]
    NonFiniteStart(f64),

    #[error("Optimizer options are invalid: {0}")]
    InvalidOptions(String),
}

/// A fit that was required to converge but did not.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "{model} fit did not converge (objective {objective:.6} after {evaluations} evaluations): {reason}"
)]
pub struct ConvergenceError {
    pub model: &'static str,
    pub objective: f64,
    pub evaluations: usize,
    pub reason: String,
}

impl FitReport {
    /// Converts a non-converged report into a [`ConvergenceError`].
    pub fn require_converged(&self, model: &'static str) -> Result<(), ConvergenceError> {
        if self.converged {
            return Ok(());
        }
        Err(ConvergenceError {
            model,
            objective: self.objective,
            evaluations: self.evaluations,
            reason: self
                .message
                .clone()
                .unwrap_or_else(|| "optimizer stopped early".to_string()),
        })
    }
}

/// The point returned by [`minimize`], in log-parameter space.
#[derive(Debug, Clone)]
pub struct Minimum {
    pub point: Array1<f64>,
    pub report: FitReport,
}

fn clamp_log_params(point: &Array1<f64>) -> Array1<f64> {
    point.mapv(|v| v.clamp(-LOG_PARAM_BOUND, LOG_PARAM_BOUND))
}

fn central_difference<F>(objective: &F, point: &Array1<f64>) -> Array1<f64>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let mut grad = Array1::zeros(point.len());
    let mut shifted = point.clone();
    for i in 0..point.len() {
        let h = GRADIENT_STEP * (1.0 + point[i].abs());
        shifted[i] = point[i] + h;
        let upper = objective(&shifted);
        shifted[i] = point[i] - h;
        let lower = objective(&shifted);
        shifted[i] = point[i];

        let slope = (upper - lower) / (2.0 * h);
        grad[i] = if slope.is_finite() { slope } else { 0.0 };
    }
    grad
}

/// Minimizes `objective` over log-parameters starting from `initial`.
pub fn minimize<F>(
    initial: Array1<f64>,
    objective: F,
    options: &OptimizerOptions,
) -> Result<Minimum, OptimizeError>
where
    F: Fn(&Array1<f64>) -> f64,
{
    options.validate()?;

    let start = clamp_log_params(&initial);
    let initial_cost = objective(&start);
    if !initial_cost.is_finite() {
        return Err(OptimizeError::NonFiniteStart(initial_cost));
    }
    log::debug!("Initial objective: {:.6}", initial_cost);

    let best = RefCell::new((initial_cost, start.clone()));
    let evaluations = Cell::new(1_usize);

    let cost_and_grad = |point: &Array1<f64>| -> (f64, Array1<f64>) {
        let safe_point = clamp_log_params(point);
        let cost = objective(&safe_point);
        evaluations.set(evaluations.get() + 1);

        let cost = if cost.is_finite() {
            let mut best = best.borrow_mut();
            if cost < best.0 {
                *best = (cost, safe_point.clone());
            }
            cost
        } else {
            log::warn!("Non-finite objective at {:?}, returning large finite value", safe_point);
            NON_FINITE_COST
        };

        (cost, central_difference(&objective, &safe_point))
    };

    let outcome = Bfgs::new(start, cost_and_grad)
        .with_tolerance(options.tolerance)
        .with_max_iterations(options.max_iterations)
        .run();

    let evaluations = evaluations.get();
    match outcome {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            log::debug!(
                "BFGS converged in {} iterations with objective {:.6}",
                iterations,
                final_value
            );
            Ok(Minimum {
                point: clamp_log_params(&final_point),
                report: FitReport {
                    converged: true,
                    iterations: Some(iterations),
                    evaluations,
                    objective: final_value,
                    message: None,
                },
            })
        }
        Err(e) => {
            let (objective, point) = best.into_inner();
            let message = format!("{e:?}");
            log::warn!("BFGS stopped before converging: {message}");
            Ok(Minimum {
                point,
                report: FitReport {
                    converged: false,
                    iterations: None,
                    evaluations,
                    objective,
                    message: Some(message),
                },
            })
        }
    }
}
