// forecast/features.rs

//! Turns per-customer order history into the recency/tenure/frequency/monetary
//! summary both models consume. Durations are measured in weeks.

use crate::monetary::MonetaryObservation;
use crate::timing::TimingObservation;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DAYS_PER_WEEK: f64 = 7.0;

/// One customer's aggregated order history across both sales channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub customer_id: String,
    pub first_order_date: NaiveDate,
    pub last_order_date: NaiveDate,
    pub online_orders: u32,
    pub offline_orders: u32,
    pub online_spend: f64,
    pub offline_spend: f64,
}

/// How the purchase count maps to the models' `frequency`.
///
/// `monetary` is always total spend over total purchases. Under
/// `TotalPurchases` it is the average of exactly `frequency` transactions, as
/// the spend model assumes. Under `RepeatPurchases` it still averages
/// `frequency + 1` transactions (the first order included), so the spend
/// model's shrinkage weight slightly understates the evidence behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyConvention {
    /// Purchases after the first one (`total − 1`).
    RepeatPurchases,
    /// Every purchase, the first one included.
    #[default]
    TotalPurchases,
}

/// The per-customer model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerSummary {
    pub customer_id: String,
    /// Weeks between the first and the last purchase.
    pub recency: f64,
    /// Weeks between the first purchase and the analysis cutoff.
    pub t: f64,
    pub frequency: u32,
    /// Average revenue per purchase.
    pub monetary: f64,
}

impl CustomerSummary {
    pub fn timing_observation(&self) -> TimingObservation {
        TimingObservation::new(self.frequency, self.recency, self.t)
    }

    pub fn monetary_observation(&self) -> MonetaryObservation {
        MonetaryObservation::new(self.frequency, self.monetary)
    }
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Cannot derive features from an empty customer table.")]
    EmptyInput,

    #[error("The cutoff margin must be non-negative, but was {0} days.")]
    NegativeMargin(i64),

    #[error("Customer '{0}' has no recorded purchases.")]
    ZeroPurchases(String),

    #[error("Customer '{0}' has more purchases than can be represented.")]
    PurchaseCountOverflow(String),

    #[error("Customer '{customer_id}' has last purchase {last} before first purchase {first}.")]
    LastBeforeFirst {
        customer_id: String,
        first: NaiveDate,
        last: NaiveDate,
    },

    #[error("Analysis cutoff {cutoff} is earlier than the last purchase {last} of customer '{customer_id}'.")]
    CutoffBeforeLastPurchase {
        customer_id: String,
        cutoff: NaiveDate,
        last: NaiveDate,
    },

    #[error("Customer '{customer_id}' has invalid spend {spend}: spend must be finite and non-negative.")]
    InvalidSpend { customer_id: String, spend: f64 },

    #[error(
        "Customer '{0}' made a single purchase but has different first and last purchase dates."
    )]
    InconsistentSinglePurchase(String),
}

/// Options for [`derive`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeriveOptions {
    pub cutoff: NaiveDate,
    pub convention: FrequencyConvention,
}

/// The date the tenure of every customer is measured to: the latest purchase
/// in the table plus `margin_days`.
pub fn analysis_cutoff(
    rows: &[TransactionSummary],
    margin_days: i64,
) -> Result<NaiveDate, FeatureError> {
    if margin_days < 0 {
        return Err(FeatureError::NegativeMargin(margin_days));
    }
    let latest = rows
        .iter()
        .map(|row| row.last_order_date)
        .max()
        .ok_or(FeatureError::EmptyInput)?;
    Ok(latest + Duration::days(margin_days))
}

fn weeks_between(from: NaiveDate, to: NaiveDate) -> f64 {
    (to - from).num_days() as f64 / DAYS_PER_WEEK
}

fn derive_one(
    row: &TransactionSummary,
    options: &DeriveOptions,
) -> Result<CustomerSummary, FeatureError> {
    let id = || row.customer_id.clone();

    for spend in [row.online_spend, row.offline_spend] {
        if !(spend.is_finite() && spend >= 0.0) {
            return Err(FeatureError::InvalidSpend {
                customer_id: id(),
                spend,
            });
        }
    }
    if row.last_order_date < row.first_order_date {
        return Err(FeatureError::LastBeforeFirst {
            customer_id: id(),
            first: row.first_order_date,
            last: row.last_order_date,
        });
    }
    if options.cutoff < row.last_order_date {
        return Err(FeatureError::CutoffBeforeLastPurchase {
            customer_id: id(),
            cutoff: options.cutoff,
            last: row.last_order_date,
        });
    }

    let total_purchases = row
        .online_orders
        .checked_add(row.offline_orders)
        .ok_or_else(|| FeatureError::PurchaseCountOverflow(id()))?;
    if total_purchases == 0 {
        return Err(FeatureError::ZeroPurchases(id()));
    }
    let total_spend = row.online_spend + row.offline_spend;

    let recency = weeks_between(row.first_order_date, row.last_order_date);
    let frequency = match options.convention {
        FrequencyConvention::RepeatPurchases => total_purchases - 1,
        FrequencyConvention::TotalPurchases => total_purchases,
    };
    if frequency == 0 && recency > 0.0 {
        return Err(FeatureError::InconsistentSinglePurchase(id()));
    }

    Ok(CustomerSummary {
        customer_id: id(),
        recency,
        t: weeks_between(row.first_order_date, options.cutoff),
        frequency,
        monetary: total_spend / f64::from(total_purchases),
    })
}

/// Derives one [`CustomerSummary`] per row, in input order. The first invalid
/// row aborts the whole derivation.
pub fn derive(
    rows: &[TransactionSummary],
    options: &DeriveOptions,
) -> Result<Vec<CustomerSummary>, FeatureError> {
    if rows.is_empty() {
        return Err(FeatureError::EmptyInput);
    }
    let customers = rows
        .iter()
        .map(|row| derive_one(row, options))
        .collect::<Result<Vec<_>, _>>()?;

    let total_purchases: u64 = rows
        .iter()
        .map(|row| u64::from(row.online_orders) + u64::from(row.offline_orders))
        .sum();
    log::info!(
        "Derived features for {} customers ({} purchases) with cutoff {}.",
        customers.len(),
        total_purchases,
        options.cutoff
    );
    Ok(customers)
}
