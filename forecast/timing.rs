// forecast/timing.rs

//! # Purchase-Timing and Dropout Model (BG/NBD)
//!
//! Each customer buys according to a Poisson process with a personal rate
//! `λ ~ Gamma(r, α)` and, after every repeat purchase, drops out for good
//! with a personal probability `p ~ Beta(a, b)` (Fader, Hardie & Lee, 2005).
//! Only three statistics per customer are needed:
//!
//! - `frequency` (`x`): number of repeat purchases,
//! - `recency` (`tₓ`): time of the last purchase, measured from the first,
//! - `t` (`T`): time between the first purchase and the end of observation.
//!
//! [`fit`] estimates `(r, α, a, b)` by penalized maximum likelihood over the
//! whole population. The result is an immutable [`TimingModelParams`] that is
//! passed by reference into every per-customer prediction.

use crate::optimize::{self, ConvergenceError, FitReport, OptimizeError, OptimizerOptions};
use crate::special::{
    HypergeometricError, expit, ln_beta, ln_gamma, log_add_exp, signed_ln_hyp2f1,
};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Times are rescaled so the longest tenure equals this value before fitting.
const FIT_TIME_SCALE_TARGET: f64 = 10.0;

/// Within this distance of `a = 1` the expected-transaction formulas are 0/0.
const UNIT_A_BAND: f64 = 1e-7;

/// Offset of the two points interpolated across the `a = 1` band.
const UNIT_A_STEP: f64 = 1e-5;

/// The sufficient statistics of one customer's purchase history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingObservation {
    pub frequency: u32,
    pub recency: f64,
    pub t: f64,
}

impl TimingObservation {
    pub fn new(frequency: u32, recency: f64, t: f64) -> Self {
        Self {
            frequency,
            recency,
            t,
        }
    }

    /// Rejects histories the model cannot describe.
    pub fn validate(&self) -> Result<(), TimingError> {
        let reason = if !self.recency.is_finite() || !self.t.is_finite() {
            Some("recency and T must be finite")
        } else if self.recency < 0.0 {
            Some("recency must be non-negative")
        } else if self.t < self.recency {
            Some("T must be at least recency")
        } else if self.frequency == 0 && self.recency != 0.0 {
            Some("recency must be zero when frequency is zero")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(TimingError::InvalidObservation {
                frequency: self.frequency,
                recency: self.recency,
                t: self.t,
                reason,
            }),
            None => Ok(()),
        }
    }

    fn rescaled(&self, scale: f64) -> Self {
        Self {
            frequency: self.frequency,
            recency: self.recency * scale,
            t: self.t * scale,
        }
    }
}

#[derive(Error, Debug)]
pub enum TimingError {
    #[error(
        "Invalid customer history (frequency={frequency}, recency={recency}, T={t}): {reason}."
    )]
    InvalidObservation {
        frequency: u32,
        recency: f64,
        t: f64,
        reason: &'static str,
    },

    #[error("Cannot fit the timing model on an empty population.")]
    EmptyPopulation,

    #[error("Cannot fit the timing model: every customer has T = 0.")]
    ZeroObservationWindow,

    #[error("Penalizer must be finite and non-negative, but was {0}.")]
    InvalidPenalizer(f64),

    #[error("Time horizon must be finite and non-negative, but was {0}.")]
    InvalidHorizon(f64),

    #[error("The closed-form prediction is not finite for parameters {params:?}: {quantity}.")]
    NonFinitePrediction {
        params: TimingModelParams,
        quantity: &'static str,
    },

    #[error("Cannot evaluate {quantity} for parameters {params:?}: ₂F₁ {source}.")]
    Hypergeometric {
        params: TimingModelParams,
        quantity: &'static str,
        #[source]
        source: HypergeometricError,
    },

    #[error("Timing model optimization failed: {0}")]
    Optimization(#[from] OptimizeError),
}

/// Population-level BG/NBD parameters.
///
/// `r` and `alpha` are the shape and scale of the Gamma purchase-rate
/// distribution; `a` and `b` are the Beta dropout-probability shapes. `alpha`
/// is in the same time unit as the observations the model was fit on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingModelParams {
    pub r: f64,
    pub alpha: f64,
    pub a: f64,
    pub b: f64,
}

impl TimingModelParams {
    fn from_log(log_params: &Array1<f64>) -> Self {
        Self {
            r: log_params[0].exp(),
            alpha: log_params[1].exp(),
            a: log_params[2].exp(),
            b: log_params[3].exp(),
        }
    }

    fn sum_of_squares(&self) -> f64 {
        self.r * self.r + self.alpha * self.alpha + self.a * self.a + self.b * self.b
    }

    fn non_finite(&self, quantity: &'static str) -> TimingError {
        TimingError::NonFinitePrediction {
            params: *self,
            quantity,
        }
    }

    fn hypergeometric(&self, quantity: &'static str, source: HypergeometricError) -> TimingError {
        TimingError::Hypergeometric {
            params: *self,
            quantity,
            source,
        }
    }

    /// Evaluates `f` directly, or interpolates it across the removable
    /// singularity of the expected-transaction formulas at `a = 1`.
    fn bridge_unit_a(
        &self,
        f: impl Fn(&Self) -> Result<f64, TimingError>,
    ) -> Result<f64, TimingError> {
        if (self.a - 1.0).abs() > UNIT_A_BAND {
            return f(self);
        }
        let below = f(&Self {
            a: 1.0 - UNIT_A_STEP,
            ..*self
        })?;
        let above = f(&Self {
            a: 1.0 + UNIT_A_STEP,
            ..*self
        })?;
        let weight = (self.a - (1.0 - UNIT_A_STEP)) / (2.0 * UNIT_A_STEP);
        Ok(below + weight * (above - below))
    }

    /// Log-likelihood of one customer's history. No validation is done here;
    /// callers are expected to have validated the observation.
    pub fn log_likelihood(&self, obs: &TimingObservation) -> f64 {
        let x = f64::from(obs.frequency);
        let Self { r, alpha, a, b } = *self;

        let a1 = ln_gamma(r + x) - ln_gamma(r) + r * alpha.ln();
        let a2 = ln_gamma(a + b) + ln_gamma(b + x) - ln_gamma(b) - ln_gamma(a + b + x);
        let a3 = -(r + x) * (alpha + obs.t).ln();

        // Customers with repeat purchases may also have dropped out right
        // after the last one.
        let tail = if obs.frequency > 0 {
            let a4 = a.ln() - (b + x - 1.0).ln() - (r + x) * (alpha + obs.recency).ln();
            log_add_exp(a3, a4)
        } else {
            a3
        };

        a1 + a2 + tail
    }

    /// Mean log-likelihood over a population.
    pub fn mean_log_likelihood(&self, samples: &[TimingObservation]) -> f64 {
        if samples.is_empty() {
            return f64::NAN;
        }
        let total: f64 = samples.par_iter().map(|obs| self.log_likelihood(obs)).sum();
        total / samples.len() as f64
    }

    /// Expected number of transactions in `(T, T + horizon]` for a customer
    /// with the given history.
    pub fn expected_transactions(
        &self,
        horizon: f64,
        obs: &TimingObservation,
    ) -> Result<f64, TimingError> {
        obs.validate()?;
        if !(horizon.is_finite() && horizon >= 0.0) {
            return Err(TimingError::InvalidHorizon(horizon));
        }
        if horizon == 0.0 {
            return Ok(0.0);
        }

        self.bridge_unit_a(|params| params.conditional_expectation(horizon, obs))
    }

    fn conditional_expectation(
        &self,
        horizon: f64,
        obs: &TimingObservation,
    ) -> Result<f64, TimingError> {
        const QUANTITY: &str = "conditional expected transactions";
        let x = f64::from(obs.frequency);
        let Self { r, alpha, a, b } = *self;

        // c goes negative for x = 0 and a + b < 1; ₂F₁ can then be negative.
        let hyp_c = a + b + x - 1.0;
        let z = horizon / (alpha + obs.t + horizon);
        let hyp = signed_ln_hyp2f1(r + x, b + x, hyp_c, z)
            .map_err(|source| self.hypergeometric(QUANTITY, source))?;

        let first_term = hyp_c / (a - 1.0);
        let ln_shrink = (r + x) * ((alpha + obs.t) / (alpha + obs.t + horizon)).ln();
        let second_term = hyp.one_minus_scaled(ln_shrink);

        let denominator = if obs.frequency > 0 {
            1.0 + (a / (b + x - 1.0)) * ((alpha + obs.t) / (alpha + obs.recency)).powf(r + x)
        } else {
            1.0
        };

        let expected = first_term * second_term / denominator;
        if !expected.is_finite() {
            return Err(self.non_finite(QUANTITY));
        }
        Ok(expected.max(0.0))
    }

    /// Posterior probability that the customer has not dropped out by `T`.
    pub fn probability_active(&self, obs: &TimingObservation) -> Result<f64, TimingError> {
        obs.validate()?;
        if obs.frequency == 0 {
            return Ok(1.0);
        }

        let x = f64::from(obs.frequency);
        let Self { r, alpha, a, b } = *self;
        let log_odds_inactive = (r + x) * ((alpha + obs.t) / (alpha + obs.recency)).ln()
            + (a / (b + x - 1.0)).ln();

        let probability = expit(-log_odds_inactive);
        if !probability.is_finite() {
            return Err(self.non_finite("probability active"));
        }
        Ok(probability)
    }

    /// Expected number of repeat transactions in `(0, t]` for a customer
    /// acquired at time zero.
    pub fn expected_transactions_new_customer(&self, t: f64) -> Result<f64, TimingError> {
        if !(t.is_finite() && t >= 0.0) {
            return Err(TimingError::InvalidHorizon(t));
        }
        if t == 0.0 {
            return Ok(0.0);
        }

        self.bridge_unit_a(|params| params.unconditional_expectation(t))
    }

    fn unconditional_expectation(&self, t: f64) -> Result<f64, TimingError> {
        const QUANTITY: &str = "unconditional expected transactions";
        let Self { r, alpha, a, b } = *self;
        let z = t / (alpha + t);
        let hyp = signed_ln_hyp2f1(r, b, a + b - 1.0, z)
            .map_err(|source| self.hypergeometric(QUANTITY, source))?;
        let first_term = (a + b - 1.0) / (a - 1.0);
        let second_term = hyp.one_minus_scaled(r * (alpha / (alpha + t)).ln());

        let expected = first_term * second_term;
        if !expected.is_finite() {
            return Err(self.non_finite(QUANTITY));
        }
        Ok(expected.max(0.0))
    }

    /// Probability that a customer acquired at time zero makes exactly `n`
    /// repeat purchases in `(0, t]`.
    pub fn probability_of_purchases(&self, n: u32, t: f64) -> Result<f64, TimingError> {
        if !(t.is_finite() && t >= 0.0) {
            return Err(TimingError::InvalidHorizon(t));
        }

        let nf = f64::from(n);
        let Self { r, alpha, a, b } = *self;
        let ln_stay = r * (alpha / (alpha + t)).ln();
        let z = t / (alpha + t);

        let ln_first = ln_beta(a, b + nf) - ln_beta(a, b) + ln_gamma(r + nf)
            - ln_gamma(r)
            - ln_gamma(nf + 1.0)
            + ln_stay
            + if n > 0 { nf * z.ln() } else { 0.0 };
        let mut probability = ln_first.exp();

        if n > 0 {
            // Σ_{j<n} Γ(r+j) / (Γ(r) j!) zʲ, accumulated term by term.
            let mut term = 1.0;
            let mut partial = 0.0;
            for j in 0..n {
                partial += term;
                let jf = f64::from(j);
                term *= (r + jf) / (jf + 1.0) * z;
            }
            let dropped = (ln_beta(a + 1.0, b + nf - 1.0) - ln_beta(a, b)).exp();
            probability += dropped * (1.0 - ln_stay.exp() * partial);
        }

        if !probability.is_finite() {
            return Err(self.non_finite("purchase count probability"));
        }
        Ok(probability.clamp(0.0, 1.0))
    }
}

/// Settings for one timing-model fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingFitOptions {
    /// Weight of the `r² + α² + a² + b²` penalty, on the rescaled time axis.
    pub penalizer: f64,
    pub optimizer: OptimizerOptions,
}

impl Default for TimingFitOptions {
    fn default() -> Self {
        Self {
            penalizer: 0.0,
            optimizer: OptimizerOptions::default(),
        }
    }
}

/// Fitted timing parameters together with how the optimizer ended.
#[derive(Debug, Clone)]
pub struct TimingFit {
    pub params: TimingModelParams,
    pub report: FitReport,
}

impl TimingFit {
    /// Returns the parameters only if the optimizer converged.
    pub fn require_converged(&self) -> Result<TimingModelParams, ConvergenceError> {
        self.report.require_converged("BG/NBD timing")?;
        Ok(self.params)
    }
}

fn penalized_objective(
    params: &TimingModelParams,
    samples: &[TimingObservation],
    penalizer: f64,
) -> f64 {
    -params.mean_log_likelihood(samples) + penalizer * params.sum_of_squares()
}

/// Fits the BG/NBD model to a customer population.
pub fn fit(
    samples: &[TimingObservation],
    options: &TimingFitOptions,
) -> Result<TimingFit, TimingError> {
    if !(options.penalizer.is_finite() && options.penalizer >= 0.0) {
        return Err(TimingError::InvalidPenalizer(options.penalizer));
    }
    if samples.is_empty() {
        return Err(TimingError::EmptyPopulation);
    }
    for obs in samples {
        obs.validate()?;
    }

    let max_t = samples.iter().map(|obs| obs.t).fold(0.0_f64, f64::max);
    if max_t <= 0.0 {
        return Err(TimingError::ZeroObservationWindow);
    }
    let scale = FIT_TIME_SCALE_TARGET / max_t;
    let scaled: Vec<TimingObservation> = samples.iter().map(|obs| obs.rescaled(scale)).collect();

    log::info!(
        "Fitting BG/NBD timing model on {} customers (penalizer {}).",
        samples.len(),
        options.penalizer
    );

    let objective = |log_params: &Array1<f64>| {
        penalized_objective(
            &TimingModelParams::from_log(log_params),
            &scaled,
            options.penalizer,
        )
    };
    let minimum = optimize::minimize(Array1::zeros(4), objective, &options.optimizer)?;

    let on_scaled_axis = TimingModelParams::from_log(&minimum.point);
    let params = TimingModelParams {
        alpha: on_scaled_axis.alpha / scale,
        ..on_scaled_axis
    };

    if minimum.report.converged {
        log::info!(
            "BG/NBD fit converged: r={:.4}, alpha={:.4}, a={:.4}, b={:.4} (objective {:.6}).",
            params.r,
            params.alpha,
            params.a,
            params.b,
            minimum.report.objective
        );
    } else {
        log::warn!(
            "BG/NBD fit did not converge; keeping best estimate r={:.4}, alpha={:.4}, a={:.4}, b={:.4}.",
            params.r,
            params.alpha,
            params.a,
            params.b
        );
    }

    Ok(TimingFit {
        params,
        report: minimum.report,
    })
}
