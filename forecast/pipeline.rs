// forecast/pipeline.rs

//! # End-to-End Forecast
//!
//! 1. Fit the timing and monetary models concurrently on the customer table.
//! 2. Predict every customer's horizon transactions, activity probability,
//!    expected spend and lifetime value in parallel from the shared
//!    parameters.
//! 3. Segment customers by lifetime value.

use crate::config::{ConfigError, ForecastConfig};
use crate::data::{self, DataError};
use crate::diagnostics::{self, CORRELATION_WARNING_LEVEL};
use crate::features::{self, CustomerSummary, DeriveOptions, FeatureError};
use crate::monetary::{self, MonetaryError, MonetaryFit, MonetaryModelParams, MonetaryObservation};
use crate::optimize::ConvergenceError;
use crate::projection::{self, ProjectionError, ProjectionOptions};
use crate::segment::{self, SegmentError, TierSummary};
use crate::timing::{self, TimingError, TimingFit, TimingModelParams};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Cannot forecast an empty customer table.")]
    EmptyPopulation,
    #[error("Failed to load input data: {0}")]
    Data(#[from] DataError),
    #[error("Failed to derive customer features: {0}")]
    Features(#[from] FeatureError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Monetary(#[from] MonetaryError),
    #[error("Failed to project lifetime value for customer '{customer_id}': {source}")]
    Projection {
        customer_id: String,
        #[source]
        source: ProjectionError,
    },
    #[error("Segmentation failed: {0}")]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Convergence(#[from] ConvergenceError),
}

/// The forecast for one customer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerProjection {
    pub customer_id: String,
    pub recency: f64,
    pub t: f64,
    pub frequency: u32,
    pub monetary: f64,
    pub expected_transactions_short: f64,
    pub expected_transactions_long: f64,
    pub probability_active: f64,
    pub expected_average_profit: f64,
    pub lifetime_value: f64,
    pub segment: String,
}

/// Fitted models plus per-customer projections, in input order.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub timing: TimingFit,
    pub monetary: MonetaryFit,
    pub projections: Vec<CustomerProjection>,
    pub segments: Vec<TierSummary>,
    /// Frequency/spend correlation among the customers the monetary model
    /// was fit on.
    pub frequency_monetary_correlation: Option<f64>,
}

/// Customers the monetary model can learn from.
fn monetary_samples(customers: &[CustomerSummary]) -> Vec<MonetaryObservation> {
    customers
        .iter()
        .filter(|c| c.frequency > 0)
        .map(CustomerSummary::monetary_observation)
        .collect()
}

/// Fits both models on the same customer table, concurrently.
pub fn fit_models(
    customers: &[CustomerSummary],
    config: &ForecastConfig,
) -> Result<(TimingFit, MonetaryFit), PipelineError> {
    if customers.is_empty() {
        return Err(PipelineError::EmptyPopulation);
    }
    config.validate()?;

    let timing_samples: Vec<_> = customers
        .iter()
        .map(CustomerSummary::timing_observation)
        .collect();
    let monetary_samples = monetary_samples(customers);
    let excluded = customers.len() - monetary_samples.len();
    if excluded > 0 {
        log::info!(
            "{excluded} customers without repeat purchases are left out of the monetary fit."
        );
    }

    if let Some(rho) = diagnostics::frequency_monetary_correlation(&monetary_samples) {
        if rho.abs() > CORRELATION_WARNING_LEVEL {
            log::warn!(
                "Frequency and mean spend are correlated (r = {rho:.3}); the monetary model assumes they are independent."
            );
        }
    }

    let timing_options = config.timing_options();
    let monetary_options = config.monetary_options();
    let (timing_fit, monetary_fit) = rayon::join(
        || timing::fit(&timing_samples, &timing_options),
        || monetary::fit(&monetary_samples, &monetary_options),
    );
    let timing_fit = timing_fit?;
    let monetary_fit = monetary_fit?;

    if config.require_convergence {
        timing_fit.require_converged()?;
        monetary_fit.require_converged()?;
    }
    Ok((timing_fit, monetary_fit))
}

fn project_customer(
    customer: &CustomerSummary,
    timing: &TimingModelParams,
    monetary: &MonetaryModelParams,
    config: &ForecastConfig,
) -> Result<CustomerProjection, PipelineError> {
    let obs = customer.timing_observation();
    let wrap = |source: ProjectionError| PipelineError::Projection {
        customer_id: customer.customer_id.clone(),
        source,
    };

    let short = timing
        .expected_transactions(config.horizons.short_weeks, &obs)
        .map_err(|e| wrap(e.into()))?;
    let long = timing
        .expected_transactions(config.horizons.long_weeks, &obs)
        .map_err(|e| wrap(e.into()))?;
    let alive = timing.probability_active(&obs).map_err(|e| wrap(e.into()))?;
    let profit = projection::expected_average_value(monetary, customer.frequency, customer.monetary)
        .map_err(|e| wrap(e.into()))?;
    let value = projection::project(timing, profit, &obs, &config.projection).map_err(wrap)?;

    Ok(CustomerProjection {
        customer_id: customer.customer_id.clone(),
        recency: customer.recency,
        t: customer.t,
        frequency: customer.frequency,
        monetary: customer.monetary,
        expected_transactions_short: short,
        expected_transactions_long: long,
        probability_active: alive,
        expected_average_profit: profit,
        lifetime_value: value,
        segment: String::new(),
    })
}

/// Fits both models and forecasts every customer.
pub fn run(customers: &[CustomerSummary], config: &ForecastConfig) -> Result<Forecast, PipelineError> {
    let (timing_fit, monetary_fit) = fit_models(customers, config)?;
    let frequency_monetary_correlation =
        diagnostics::frequency_monetary_correlation(&monetary_samples(customers));

    log::info!("Projecting {} customers.", customers.len());
    let mut projections: Vec<CustomerProjection> = customers
        .par_iter()
        .map(|c| project_customer(c, &timing_fit.params, &monetary_fit.params, config))
        .collect::<Result<_, _>>()?;

    let values: Vec<f64> = projections.iter().map(|p| p.lifetime_value).collect();
    let segmentation = segment::segment(&values, &config.segmentation)?;
    for (i, projection) in projections.iter_mut().enumerate() {
        projection.segment = segmentation.label(i).to_string();
    }
    let segments = segment::summarize(&values, &segmentation);
    for tier in &segments {
        log::info!(
            "Segment {}: {} customers, total value {:.2}.",
            tier.label,
            tier.count,
            tier.sum
        );
    }

    Ok(Forecast {
        timing: timing_fit,
        monetary: monetary_fit,
        projections,
        segments,
        frequency_monetary_correlation,
    })
}

/// Loads a customer table and derives the model inputs, using the cutoff
/// margin and frequency convention from `config`.
pub fn load_customers(
    path: &Path,
    config: &ForecastConfig,
) -> Result<Vec<CustomerSummary>, PipelineError> {
    config.validate()?;
    let rows = data::load_transaction_summaries(path, &config.load_options())?;
    let cutoff = features::analysis_cutoff(&rows, config.features.cutoff_margin_days)?;
    let options = DeriveOptions {
        cutoff,
        convention: config.features.frequency_convention,
    };
    Ok(features::derive(&rows, &options)?)
}

/// Lifetime value of a single customer under already fitted models.
pub fn customer_lifetime_value(
    timing: &TimingModelParams,
    monetary: &MonetaryModelParams,
    customer: &CustomerSummary,
    options: &ProjectionOptions,
) -> Result<f64, ProjectionError> {
    projection::lifetime_value(
        timing,
        monetary,
        customer.frequency,
        customer.recency,
        customer.t,
        customer.monetary,
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> Vec<CustomerSummary> {
        (0..200_u32)
            .map(|i| {
                let frequency = i % 6;
                let t = 30.0 + f64::from(i % 11) * 2.0;
                let recency = if frequency == 0 {
                    0.0
                } else {
                    t * f64::from(i % 4 + 1) / 5.0
                };
                CustomerSummary {
                    customer_id: format!("c{i}"),
                    recency,
                    t,
                    frequency,
                    monetary: 40.0 + f64::from((i * 13) % 50),
                }
            })
            .collect()
    }

    #[test]
    fn forecasts_every_customer_in_order() {
        let config = ForecastConfig::default();
        let input = customers();
        let forecast = run(&input, &config).unwrap();

        assert_eq!(forecast.projections.len(), input.len());
        for (p, c) in forecast.projections.iter().zip(&input) {
            assert_eq!(p.customer_id, c.customer_id);
            assert!(p.expected_transactions_long >= p.expected_transactions_short);
            assert!((0.0..=1.0).contains(&p.probability_active));
            assert!(p.expected_average_profit > 0.0);
            assert!(p.lifetime_value >= 0.0);
            assert!(["A", "B", "C", "D"].contains(&p.segment.as_str()));
        }
        assert_eq!(
            forecast.segments.iter().map(|s| s.count).sum::<usize>(),
            input.len()
        );
    }

    #[test]
    fn single_projection_matches_pipeline() {
        let config = ForecastConfig::default();
        let input = customers();
        let forecast = run(&input, &config).unwrap();
        let direct = customer_lifetime_value(
            &forecast.timing.params,
            &forecast.monetary.params,
            &input[7],
            &config.projection,
        )
        .unwrap();
        assert_eq!(direct, forecast.projections[7].lifetime_value);
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(matches!(
            run(&[], &ForecastConfig::default()),
            Err(PipelineError::EmptyPopulation)
        ));
    }

    #[test]
    fn table_without_repeat_buyers_cannot_fit_spend() {
        let input: Vec<CustomerSummary> = (0..10_u32)
            .map(|i| CustomerSummary {
                customer_id: format!("c{i}"),
                recency: 0.0,
                t: 10.0 + f64::from(i),
                frequency: 0,
                monetary: 25.0,
            })
            .collect();
        assert!(matches!(
            run(&input, &ForecastConfig::default()),
            Err(PipelineError::Monetary(MonetaryError::EmptyPopulation))
        ));
    }
}
