// forecast/monetary.rs

//! # Monetary-Value Model (Gamma-Gamma)
//!
//! The average value of a customer's transactions is modelled as Gamma
//! distributed around a personal mean, and that personal mean is itself drawn
//! from an inverse-Gamma population distribution with parameters `(p, q, v)`
//! (Fader, Hardie & Lee, 2005). Only customers with at least one transaction
//! in the summary carry information, so every observation must have
//! `frequency > 0`.
//!
//! The conditional expectation is a shrinkage estimator: a weighted average of
//! the population mean and the customer's observed mean, with the weight
//! moving towards the observed mean as the frequency grows.

use crate::optimize::{self, ConvergenceError, FitReport, OptimizeError, OptimizerOptions};
use crate::special::ln_gamma;
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One customer's transaction count and average transaction value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonetaryObservation {
    pub frequency: u32,
    pub monetary: f64,
}

impl MonetaryObservation {
    pub fn new(frequency: u32, monetary: f64) -> Self {
        Self {
            frequency,
            monetary,
        }
    }

    pub fn validate(&self) -> Result<(), MonetaryError> {
        let reason = if self.frequency == 0 {
            Some("frequency must be positive")
        } else if !self.monetary.is_finite() || self.monetary <= 0.0 {
            Some("monetary value must be positive and finite")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(MonetaryError::InvalidObservation {
                frequency: self.frequency,
                monetary: self.monetary,
                reason,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Error, Debug)]
pub enum MonetaryError {
    #[error("Invalid monetary observation (frequency={frequency}, monetary={monetary}): {reason}.")]
    InvalidObservation {
        frequency: u32,
        monetary: f64,
        reason: &'static str,
    },

    #[error("Cannot fit the monetary model on an empty population.")]
    EmptyPopulation,

    #[error("Penalizer must be finite and non-negative, but was {0}.")]
    InvalidPenalizer(f64),

    #[error(
        "The population mean spend is undefined because q = {q} is not greater than 1. Refit with constrain_q enabled."
    )]
    UndefinedMean { q: f64 },

    #[error("Monetary model optimization failed: {0}")]
    Optimization(#[from] OptimizeError),
}

/// Population-level Gamma-Gamma parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonetaryModelParams {
    pub p: f64,
    pub q: f64,
    pub v: f64,
}

impl MonetaryModelParams {
    fn from_log(log_params: &Array1<f64>, constrain_q: bool) -> Self {
        let q = if constrain_q {
            1.0 + log_params[1].exp()
        } else {
            log_params[1].exp()
        };
        Self {
            p: log_params[0].exp(),
            q,
            v: log_params[2].exp(),
        }
    }

    fn sum_of_squares(&self) -> f64 {
        self.p * self.p + self.q * self.q + self.v * self.v
    }

    /// Log-likelihood of one customer's observed mean spend.
    pub fn log_likelihood(&self, obs: &MonetaryObservation) -> f64 {
        let x = f64::from(obs.frequency);
        let m = obs.monetary;
        let Self { p, q, v } = *self;
        let px = p * x;

        ln_gamma(px + q) - ln_gamma(px) - ln_gamma(q) + q * v.ln() + (px - 1.0) * m.ln()
            + px * x.ln()
            - (px + q) * (x * m + v).ln()
    }

    pub fn mean_log_likelihood(&self, samples: &[MonetaryObservation]) -> f64 {
        if samples.is_empty() {
            return f64::NAN;
        }
        let total: f64 = samples.par_iter().map(|obs| self.log_likelihood(obs)).sum();
        total / samples.len() as f64
    }

    /// Expected spend per transaction across the population, `v·p / (q − 1)`.
    pub fn population_mean(&self) -> Result<f64, MonetaryError> {
        if self.q <= 1.0 {
            return Err(MonetaryError::UndefinedMean { q: self.q });
        }
        Ok(self.v * self.p / (self.q - 1.0))
    }

    /// Expected average transaction value for a customer, given their
    /// observed frequency and mean spend.
    pub fn conditional_expected_value(
        &self,
        obs: &MonetaryObservation,
    ) -> Result<f64, MonetaryError> {
        obs.validate()?;
        let population_mean = self.population_mean()?;

        let px = self.p * f64::from(obs.frequency);
        let weight = px / (px + self.q - 1.0);
        Ok((1.0 - weight) * population_mean + weight * obs.monetary)
    }
}

/// Settings for one monetary-model fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonetaryFitOptions {
    /// Weight of the `p² + q² + v²` penalty, with spend rescaled to a unit
    /// mean.
    pub penalizer: f64,
    /// Keeps `q > 1` so the population mean always exists.
    pub constrain_q: bool,
    pub optimizer: OptimizerOptions,
}

impl Default for MonetaryFitOptions {
    fn default() -> Self {
        Self {
            penalizer: 0.0,
            constrain_q: false,
            optimizer: OptimizerOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonetaryFit {
    pub params: MonetaryModelParams,
    pub report: FitReport,
}

impl MonetaryFit {
    pub fn require_converged(&self) -> Result<MonetaryModelParams, ConvergenceError> {
        self.report.require_converged("Gamma-Gamma monetary")?;
        Ok(self.params)
    }
}

/// Fits the Gamma-Gamma model. Every observation must have at least one
/// transaction and a positive mean spend.
pub fn fit(
    samples: &[MonetaryObservation],
    options: &MonetaryFitOptions,
) -> Result<MonetaryFit, MonetaryError> {
    if !(options.penalizer.is_finite() && options.penalizer >= 0.0) {
        return Err(MonetaryError::InvalidPenalizer(options.penalizer));
    }
    if samples.is_empty() {
        return Err(MonetaryError::EmptyPopulation);
    }
    for obs in samples {
        obs.validate()?;
    }

    log::info!(
        "Fitting Gamma-Gamma monetary model on {} customers (penalizer {}, constrain_q {}).",
        samples.len(),
        options.penalizer,
        options.constrain_q
    );

    // Spend is rescaled to a unit mean so the penalty does not depend on the
    // currency; `v` is mapped back afterwards.
    let mean_spend = samples.iter().map(|obs| obs.monetary).sum::<f64>() / samples.len() as f64;
    let scale = 1.0 / mean_spend;
    let scaled: Vec<MonetaryObservation> = samples
        .iter()
        .map(|obs| MonetaryObservation::new(obs.frequency, obs.monetary * scale))
        .collect();

    let constrain_q = options.constrain_q;
    let objective = |log_params: &Array1<f64>| {
        let params = MonetaryModelParams::from_log(log_params, constrain_q);
        -params.mean_log_likelihood(&scaled) + options.penalizer * params.sum_of_squares()
    };
    let minimum = optimize::minimize(Array1::zeros(3), objective, &options.optimizer)?;
    let on_scaled_axis = MonetaryModelParams::from_log(&minimum.point, constrain_q);
    let params = MonetaryModelParams {
        v: on_scaled_axis.v / scale,
        ..on_scaled_axis
    };

    if minimum.report.converged {
        log::info!(
            "Gamma-Gamma fit converged: p={:.4}, q={:.4}, v={:.4} (objective {:.6}).",
            params.p,
            params.q,
            params.v,
            minimum.report.objective
        );
    } else {
        log::warn!(
            "Gamma-Gamma fit did not converge; keeping best estimate p={:.4}, q={:.4}, v={:.4}.",
            params.p,
            params.q,
            params.v
        );
    }
    if params.q <= 1.0 {
        log::warn!(
            "Fitted q = {:.4} leaves the population mean undefined; consider constrain_q.",
            params.q
        );
    }

    Ok(MonetaryFit {
        params,
        report: minimum.report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Published CDNOW estimates.
    fn cdnow() -> MonetaryModelParams {
        MonetaryModelParams {
            p: 6.25,
            q: 3.74,
            v: 15.44,
        }
    }

    fn synthetic_population() -> Vec<MonetaryObservation> {
        (0..300)
            .map(|i| {
                let frequency = 1 + (i % 9) as u32;
                let monetary = 20.0 + f64::from((i * 37 % 101) as u32) * 0.8;
                MonetaryObservation::new(frequency, monetary)
            })
            .collect()
    }

    #[test]
    fn single_transaction_likelihood_matches_gamma_mixture() {
        // With x = 1 the observed value is Gamma(p, ν) with ν ~ Gamma(q, v),
        // so its density is v^q m^(p−1) / (B(p, q) (m + v)^(p+q)).
        let params = cdnow();
        let m = 42.0;
        let obs = MonetaryObservation::new(1, m);
        let expected = params.q * params.v.ln() + (params.p - 1.0) * m.ln()
            - (params.p + params.q) * (m + params.v).ln()
            - (ln_gamma(params.p) + ln_gamma(params.q) - ln_gamma(params.p + params.q));
        assert_relative_eq!(params.log_likelihood(&obs), expected, max_relative = 1e-12);
    }

    #[test]
    fn expected_value_moves_towards_observed_mean_as_frequency_grows() {
        let params = cdnow();
        let observed = 80.0;
        let population = params.population_mean().unwrap();
        let mut previous_gap = (population - observed).abs();
        for frequency in [1, 2, 5, 20, 100, 1000] {
            let value = params
                .conditional_expected_value(&MonetaryObservation::new(frequency, observed))
                .unwrap();
            let gap = (value - observed).abs();
            assert!(gap < previous_gap);
            previous_gap = gap;
        }
        assert!(previous_gap < 0.5);
    }

    #[test]
    fn expected_value_lies_between_population_and_observed_mean() {
        let params = cdnow();
        let population = params.population_mean().unwrap();
        for &observed in &[5.0, 35.0, 300.0] {
            let value = params
                .conditional_expected_value(&MonetaryObservation::new(3, observed))
                .unwrap();
            let (lo, hi) = if observed < population {
                (observed, population)
            } else {
                (population, observed)
            };
            assert!(value >= lo && value <= hi);
        }
    }

    #[test]
    fn undefined_mean_is_reported() {
        let params = MonetaryModelParams {
            p: 2.0,
            q: 0.8,
            v: 10.0,
        };
        assert!(matches!(
            params.population_mean(),
            Err(MonetaryError::UndefinedMean { .. })
        ));
        assert!(matches!(
            params.conditional_expected_value(&MonetaryObservation::new(2, 10.0)),
            Err(MonetaryError::UndefinedMean { .. })
        ));
    }

    #[test]
    fn zero_frequency_is_rejected() {
        let params = cdnow();
        assert!(matches!(
            params.conditional_expected_value(&MonetaryObservation::new(0, 10.0)),
            Err(MonetaryError::InvalidObservation { .. })
        ));
        assert!(matches!(
            fit(
                &[MonetaryObservation::new(0, 10.0)],
                &MonetaryFitOptions::default()
            ),
            Err(MonetaryError::InvalidObservation { .. })
        ));
    }

    #[test]
    fn constrained_fit_keeps_population_mean_defined() {
        let options = MonetaryFitOptions {
            penalizer: 0.0,
            constrain_q: true,
            ..MonetaryFitOptions::default()
        };
        let fitted = fit(&synthetic_population(), &options).unwrap();
        assert!(fitted.params.q > 1.0);
        let mean = fitted.params.population_mean().unwrap();
        assert!(mean.is_finite() && mean > 0.0);
    }

    #[test]
    fn fit_improves_on_starting_point() {
        let population = synthetic_population();
        let fitted = fit(&population, &MonetaryFitOptions::default()).unwrap();
        let start = MonetaryModelParams {
            p: 1.0,
            q: 1.0,
            v: 1.0,
        };
        assert!(
            fitted.params.mean_log_likelihood(&population)
                > start.mean_log_likelihood(&population)
        );
    }
}
