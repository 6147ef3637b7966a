// forecast/outliers.rs

//! Caps extreme values at interquartile-range limits computed from wide
//! quantiles, so a handful of unusually large accounts do not dominate the
//! model fits.

use thiserror::Error;

/// Multiplier on the interquartile range used for the limits.
const IQR_MULTIPLIER: f64 = 1.5;

#[derive(Error, Debug, PartialEq)]
pub enum OutlierError {
    #[error("Quantiles must satisfy 0 <= lower < upper <= 1, got lower={lower}, upper={upper}.")]
    InvalidQuantiles { lower: f64, upper: f64 },

    #[error("Cannot compute quantiles of an empty column.")]
    Empty,

    #[error("Column contains a non-finite value at row {0}.")]
    NonFinite(usize),
}

fn check_values(values: &[f64]) -> Result<(), OutlierError> {
    if values.is_empty() {
        return Err(OutlierError::Empty);
    }
    match values.iter().position(|v| !v.is_finite()) {
        Some(row) => Err(OutlierError::NonFinite(row)),
        None => Ok(()),
    }
}

/// Quantile of already sorted data, interpolating linearly between the two
/// nearest ranks.
fn sorted_quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Linear-interpolated quantile of `values`.
pub fn quantile(values: &[f64], q: f64) -> Result<f64, OutlierError> {
    if !(0.0..=1.0).contains(&q) {
        return Err(OutlierError::InvalidQuantiles { lower: q, upper: q });
    }
    check_values(values)?;
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted_quantile(&sorted, q))
}

/// Returns `(low_limit, up_limit)`: the `lower`/`upper` quantiles widened by
/// 1.5 times their distance.
pub fn outlier_thresholds(
    values: &[f64],
    lower: f64,
    upper: f64,
) -> Result<(f64, f64), OutlierError> {
    if !(0.0 <= lower && lower < upper && upper <= 1.0) {
        return Err(OutlierError::InvalidQuantiles { lower, upper });
    }
    check_values(values)?;

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = sorted_quantile(&sorted, lower);
    let q3 = sorted_quantile(&sorted, upper);
    let spread = q3 - q1;
    Ok((q1 - IQR_MULTIPLIER * spread, q3 + IQR_MULTIPLIER * spread))
}

/// Clamps values outside the limits to the rounded limits and returns how
/// many values were changed.
pub fn cap_with_thresholds(
    values: &mut [f64],
    lower: f64,
    upper: f64,
) -> Result<usize, OutlierError> {
    let (low_limit, up_limit) = outlier_thresholds(values, lower, upper)?;
    let low_limit = low_limit.round_ties_even();
    let up_limit = up_limit.round_ties_even();

    let mut capped = 0;
    for value in values.iter_mut() {
        if *value > up_limit {
            *value = up_limit;
            capped += 1;
        } else if *value < low_limit {
            *value = low_limit;
            capped += 1;
        }
    }
    Ok(capped)
}
