// forecast/projection.rs

//! Discounted lifetime value over a finite horizon.
//!
//! The horizon is split into `horizon_periods` sub-periods of `period_length`
//! time units each (with weekly data and monthly periods, 4.345 weeks). The
//! expected transactions falling inside sub-period `k` are valued at the
//! customer's expected average transaction value and discounted by
//! `(1 + discount_rate)^k`.

use crate::monetary::{MonetaryError, MonetaryModelParams, MonetaryObservation};
use crate::timing::{TimingError, TimingModelParams, TimingObservation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weeks in an average calendar month.
pub const WEEKS_PER_MONTH: f64 = 4.345;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionOptions {
    /// Number of discounting sub-periods.
    pub horizon_periods: u32,
    /// Per-sub-period discount rate.
    pub discount_rate: f64,
    /// Model time units per sub-period.
    pub period_length: f64,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            horizon_periods: 6,
            discount_rate: 0.01,
            period_length: WEEKS_PER_MONTH,
        }
    }
}

impl ProjectionOptions {
    pub fn validate(&self) -> Result<(), ProjectionError> {
        if !(self.discount_rate.is_finite() && self.discount_rate >= 0.0) {
            return Err(ProjectionError::InvalidDiscountRate(self.discount_rate));
        }
        if !(self.period_length.is_finite() && self.period_length > 0.0) {
            return Err(ProjectionError::InvalidPeriodLength(self.period_length));
        }
        Ok(())
    }

    /// Total projected time span in model time units.
    pub fn horizon(&self) -> f64 {
        f64::from(self.horizon_periods) * self.period_length
    }
}

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Discount rate must be finite and non-negative, but was {0}.")]
    InvalidDiscountRate(f64),

    #[error("Period length must be finite and positive, but was {0}.")]
    InvalidPeriodLength(f64),

    #[error("Expected transaction value must be finite and non-negative, but was {0}.")]
    InvalidValue(f64),

    #[error(transparent)]
    Timing(#[from] TimingError),

    #[error(transparent)]
    Monetary(#[from] MonetaryError),
}

/// Discounted value of the transactions a customer is expected to make over
/// the projection horizon, each worth `monetary_value`.
pub fn project(
    timing: &TimingModelParams,
    monetary_value: f64,
    obs: &TimingObservation,
    options: &ProjectionOptions,
) -> Result<f64, ProjectionError> {
    options.validate()?;
    if !(monetary_value.is_finite() && monetary_value >= 0.0) {
        return Err(ProjectionError::InvalidValue(monetary_value));
    }

    let mut value = 0.0;
    let mut previous = 0.0;
    let mut discount = 1.0;
    for k in 1..=options.horizon_periods {
        let cumulative = timing.expected_transactions(f64::from(k) * options.period_length, obs)?;
        discount /= 1.0 + options.discount_rate;
        value += monetary_value * (cumulative - previous) * discount;
        previous = cumulative;
    }
    Ok(value)
}

/// [`project`] with the transaction value taken from the fitted monetary
/// model. Customers without repeat purchases are valued at the population
/// mean spend.
pub fn lifetime_value(
    timing: &TimingModelParams,
    monetary: &MonetaryModelParams,
    frequency: u32,
    recency: f64,
    t: f64,
    monetary_mean: f64,
    options: &ProjectionOptions,
) -> Result<f64, ProjectionError> {
    let obs = TimingObservation::new(frequency, recency, t);
    let value = expected_average_value(monetary, frequency, monetary_mean)?;
    project(timing, value, &obs, options)
}

/// Shrinkage estimate of spend per transaction, falling back to the
/// population mean when `frequency` is zero.
pub fn expected_average_value(
    monetary: &MonetaryModelParams,
    frequency: u32,
    monetary_mean: f64,
) -> Result<f64, MonetaryError> {
    if frequency == 0 {
        return monetary.population_mean();
    }
    monetary.conditional_expected_value(&MonetaryObservation::new(
        frequency,
        monetary_mean,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn timing() -> TimingModelParams {
        TimingModelParams {
            r: 0.243,
            alpha: 4.414,
            a: 0.793,
            b: 2.426,
        }
    }

    #[test]
    fn undiscounted_projection_telescopes() {
        let obs = TimingObservation::new(4, 20.0, 30.0);
        let options = ProjectionOptions {
            horizon_periods: 6,
            discount_rate: 0.0,
            period_length: WEEKS_PER_MONTH,
        };
        let value = project(&timing(), 55.0, &obs, &options).unwrap();
        let expected = 55.0 * timing().expected_transactions(options.horizon(), &obs).unwrap();
        assert_relative_eq!(value, expected, max_relative = 1e-12);
    }

    #[test]
    fn discounting_lowers_value() {
        let obs = TimingObservation::new(4, 20.0, 30.0);
        let plain = ProjectionOptions {
            discount_rate: 0.0,
            ..ProjectionOptions::default()
        };
        let discounted = ProjectionOptions::default();
        let a = project(&timing(), 55.0, &obs, &plain).unwrap();
        let b = project(&timing(), 55.0, &obs, &discounted).unwrap();
        assert!(b < a);
        assert!(b > a / 1.01f64.powi(6));
    }

    #[test]
    fn zero_periods_project_nothing() {
        let options = ProjectionOptions {
            horizon_periods: 0,
            ..ProjectionOptions::default()
        };
        let obs = TimingObservation::new(1, 2.0, 3.0);
        assert_eq!(project(&timing(), 10.0, &obs, &options).unwrap(), 0.0);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let obs = TimingObservation::new(1, 2.0, 3.0);
        let negative_rate = ProjectionOptions {
            discount_rate: -0.1,
            ..ProjectionOptions::default()
        };
        assert!(matches!(
            project(&timing(), 10.0, &obs, &negative_rate),
            Err(ProjectionError::InvalidDiscountRate(_))
        ));
        let no_length = ProjectionOptions {
            period_length: 0.0,
            ..ProjectionOptions::default()
        };
        assert!(matches!(
            project(&timing(), 10.0, &obs, &no_length),
            Err(ProjectionError::InvalidPeriodLength(_))
        ));
        assert!(matches!(
            project(&timing(), f64::NAN, &obs, &ProjectionOptions::default()),
            Err(ProjectionError::InvalidValue(_))
        ));
    }

    #[test]
    fn lifetime_value_composes_both_models() {
        let monetary = MonetaryModelParams {
            p: 6.25,
            q: 3.74,
            v: 15.44,
        };
        let options = ProjectionOptions::default();
        let value = lifetime_value(&timing(), &monetary, 3, 20.0, 30.0, 40.0, &options).unwrap();
        let spend = monetary
            .conditional_expected_value(&MonetaryObservation::new(3, 40.0))
            .unwrap();
        let obs = TimingObservation::new(3, 20.0, 30.0);
        assert_relative_eq!(
            value,
            project(&timing(), spend, &obs, &options).unwrap(),
            max_relative = 1e-12
        );

        let newcomer = lifetime_value(&timing(), &monetary, 0, 0.0, 30.0, 40.0, &options).unwrap();
        assert!(newcomer > 0.0);
    }

    #[test]
    fn newcomers_are_valued_when_dropout_shapes_sum_below_one() {
        let timing = TimingModelParams {
            r: 0.2216,
            alpha: 3.1312,
            a: 0.2584,
            b: 0.5278,
        };
        let monetary = MonetaryModelParams {
            p: 6.25,
            q: 3.74,
            v: 15.44,
        };
        let options = ProjectionOptions::default();
        for &t in &[1.0, 8.0, 40.0] {
            let value = lifetime_value(&timing, &monetary, 0, 0.0, t, 0.0, &options).unwrap();
            assert!(value.is_finite() && value > 0.0, "T={t}: {value}");
        }
    }
}
