// forecast/diagnostics.rs

//! Goodness-of-fit checks for the fitted models.

use crate::monetary::MonetaryObservation;
use crate::timing::{TimingError, TimingModelParams, TimingObservation};
use rayon::prelude::*;
use serde::Serialize;

/// Correlation magnitude above which the Gamma-Gamma independence assumption
/// is considered doubtful.
pub const CORRELATION_WARNING_LEVEL: f64 = 0.3;

/// Observed and model-expected number of customers with a given purchase
/// count over their own observation window. Counts are the `frequency` the
/// model was fit on, whichever convention produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodTransactionsRow {
    pub frequency: u32,
    /// True for the last row, which collects every count at or above
    /// `frequency`.
    pub is_tail: bool,
    pub observed: usize,
    pub expected: f64,
}

/// Calibration table of observed against expected customer counts per
/// `frequency` in `0..max_frequency`, with a final tail row. `params` must
/// come from a fit on the same `samples` convention.
pub fn period_transactions(
    params: &TimingModelParams,
    samples: &[TimingObservation],
    max_frequency: u32,
) -> Result<Vec<PeriodTransactionsRow>, TimingError> {
    let buckets = max_frequency as usize;

    let mut observed = vec![0_usize; buckets + 1];
    for obs in samples {
        obs.validate()?;
        observed[(obs.frequency as usize).min(buckets)] += 1;
    }

    let per_customer: Vec<Vec<f64>> = samples
        .par_iter()
        .map(|obs| {
            (0..max_frequency)
                .map(|n| params.probability_of_purchases(n, obs.t))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<_, _>>()?;

    let mut expected = vec![0.0_f64; buckets + 1];
    for probabilities in &per_customer {
        for (n, p) in probabilities.iter().enumerate() {
            expected[n] += p;
        }
    }
    let head: f64 = expected[..buckets].iter().sum();
    expected[buckets] = (samples.len() as f64 - head).max(0.0);

    Ok((0..=max_frequency)
        .map(|frequency| PeriodTransactionsRow {
            frequency,
            is_tail: frequency == max_frequency,
            observed: observed[frequency as usize],
            expected: expected[frequency as usize],
        })
        .collect())
}

/// Pearson correlation between purchase frequency and mean spend. `None`
/// when fewer than two samples are given or either column is constant.
pub fn frequency_monetary_correlation(samples: &[MonetaryObservation]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|s| f64::from(s.frequency)).sum::<f64>() / n;
    let mean_m = samples.iter().map(|s| s.monetary).sum::<f64>() / n;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for s in samples {
        let dx = f64::from(s.frequency) - mean_x;
        let dm = s.monetary - mean_m;
        sxy += dx * dm;
        sxx += dx * dx;
        syy += dm * dm;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}
