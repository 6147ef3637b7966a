// forecast/data.rs

//! # Customer Table Loading
//!
//! Reads the per-customer order summary export (one row per customer, order
//! counts and spend split by online and offline channel) and turns it into
//! [`TransactionSummary`] records.
//!
//! - Strict schema: the column names are fixed. Extra columns such as the
//!   acquisition channel or category interests are ignored.
//! - Errors name the offending column and, where possible, the row, since
//!   failures here are almost always problems with the input file.
//! - The four `*_total_*` columns can be outlier-capped before order counts
//!   are converted to integers.

use crate::features::TransactionSummary;
use crate::outliers::{self, OutlierError};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const CUSTOMER_ID: &str = "master_id";
const FIRST_ORDER_DATE: &str = "first_order_date";
const LAST_ORDER_DATE: &str = "last_order_date";
const ONLINE_ORDERS: &str = "order_num_total_ever_online";
const OFFLINE_ORDERS: &str = "order_num_total_ever_offline";
const ONLINE_SPEND: &str = "customer_value_total_ever_online";
const OFFLINE_SPEND: &str = "customer_value_total_ever_offline";

const REQUIRED_COLUMNS: [&str; 7] = [
    CUSTOMER_ID,
    FIRST_ORDER_DATE,
    LAST_ORDER_DATE,
    ONLINE_ORDERS,
    OFFLINE_ORDERS,
    ONLINE_SPEND,
    OFFLINE_SPEND,
];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),

    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),

    #[error("Row {row} of column '{column_name}' holds '{value}', which is not a date (expected YYYY-MM-DD).")]
    InvalidDate {
        column_name: String,
        row: usize,
        value: String,
    },

    #[error("Row {row} of column '{column_name}' holds {value}, which is not a whole non-negative order count.")]
    InvalidOrderCount {
        column_name: String,
        row: usize,
        value: f64,
    },

    #[error("The input file contains no data rows.")]
    NoRows,

    #[error("Outlier capping of column '{column_name}' failed: {source}")]
    Capping {
        column_name: String,
        #[source]
        source: OutlierError,
    },
}

/// Quantiles used to cap the `*_total_*` columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CappingQuantiles {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    pub separator: u8,
    /// Caps outliers in the four total columns when set.
    pub capping: Option<CappingQuantiles>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            separator: b',',
            capping: Some(CappingQuantiles {
                lower: 0.05,
                upper: 0.95,
            }),
        }
    }
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_string_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    let casted = series
        .cast(&DataType::String)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "string",
            found_type: format!("{:?}", series.dtype()),
        })?;
    let values = casted
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| DataError::MissingValuesFound(column_name.to_string()))?;
    Ok(values)
}

/// Parses `YYYY-MM-DD`, optionally followed by a time of day.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            [
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S",
                "%Y-%m-%dT%H:%M:%S%.f",
            ]
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
            .map(|datetime| datetime.date())
        })
}

fn extract_date_column(df: &DataFrame, column_name: &str) -> Result<Vec<NaiveDate>, DataError> {
    extract_string_column(df, column_name)?
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            parse_date(&text).ok_or_else(|| DataError::InvalidDate {
                column_name: column_name.to_string(),
                row: i + 1,
                value: text,
            })
        })
        .collect()
}

fn to_order_counts(values: &[f64], column_name: &str) -> Result<Vec<u32>, DataError> {
    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
                return Err(DataError::InvalidOrderCount {
                    column_name: column_name.to_string(),
                    row: i + 1,
                    value,
                });
            }
            Ok(value as u32)
        })
        .collect()
}

fn cap_column(
    values: &mut [f64],
    column_name: &str,
    quantiles: &CappingQuantiles,
) -> Result<(), DataError> {
    let capped = outliers::cap_with_thresholds(values, quantiles.lower, quantiles.upper).map_err(
        |source| DataError::Capping {
            column_name: column_name.to_string(),
            source,
        },
    )?;
    if capped > 0 {
        log::info!("Capped {capped} outliers in '{column_name}'.");
    }
    Ok(())
}

/// Loads the customer order summary at `path`.
pub fn load_transaction_summaries(
    path: &Path,
    options: &LoadOptions,
) -> Result<Vec<TransactionSummary>, DataError> {
    log::info!("Loading customer table from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(options.separator)),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::NoRows);
    }

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for column_name in REQUIRED_COLUMNS {
        if !columns_set.contains(column_name) {
            return Err(DataError::ColumnNotFound(column_name.to_string()));
        }
    }
    let df = df.select(REQUIRED_COLUMNS)?;

    let ids = extract_string_column(&df, CUSTOMER_ID)?;
    let first_dates = extract_date_column(&df, FIRST_ORDER_DATE)?;
    let last_dates = extract_date_column(&df, LAST_ORDER_DATE)?;

    let mut online_orders = extract_numeric_column(&df, ONLINE_ORDERS)?;
    let mut offline_orders = extract_numeric_column(&df, OFFLINE_ORDERS)?;
    let mut online_spend = extract_numeric_column(&df, ONLINE_SPEND)?;
    let mut offline_spend = extract_numeric_column(&df, OFFLINE_SPEND)?;

    if let Some(quantiles) = &options.capping {
        cap_column(&mut online_orders, ONLINE_ORDERS, quantiles)?;
        cap_column(&mut offline_orders, OFFLINE_ORDERS, quantiles)?;
        cap_column(&mut online_spend, ONLINE_SPEND, quantiles)?;
        cap_column(&mut offline_spend, OFFLINE_SPEND, quantiles)?;
    }

    let online_orders = to_order_counts(&online_orders, ONLINE_ORDERS)?;
    let offline_orders = to_order_counts(&offline_orders, OFFLINE_ORDERS)?;

    let rows: Vec<TransactionSummary> = ids
        .into_iter()
        .enumerate()
        .map(|(i, customer_id)| TransactionSummary {
            customer_id,
            first_order_date: first_dates[i],
            last_order_date: last_dates[i],
            online_orders: online_orders[i],
            offline_orders: offline_orders[i],
            online_spend: online_spend[i],
            offline_spend: offline_spend[i],
        })
        .collect();

    log::info!("Loaded {} customers.", rows.len());
    Ok(rows)
}
