// forecast/config.rs

//! Run configuration, stored as TOML. Every field has a default, so an empty
//! file (or no file at all) reproduces the standard analysis.

use crate::data::{CappingQuantiles, LoadOptions};
use crate::features::FrequencyConvention;
use crate::monetary::MonetaryFitOptions;
use crate::optimize::{OptimizeError, OptimizerOptions};
use crate::projection::{ProjectionError, ProjectionOptions};
use crate::segment::{SegmentError, SegmentationPolicy};
use crate::timing::TimingFitOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid segmentation settings: {0}")]
    Segmentation(#[from] SegmentError),
    #[error("Invalid projection settings: {0}")]
    Projection(#[from] ProjectionError),
    #[error("Invalid optimizer settings: {0}")]
    Optimizer(#[from] OptimizeError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub separator: char,
    pub cap_outliers: bool,
    pub lower_quantile: f64,
    pub upper_quantile: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            separator: ',',
            cap_outliers: true,
            lower_quantile: 0.05,
            upper_quantile: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Days added to the latest purchase to get the analysis cutoff.
    pub cutoff_margin_days: i64,
    pub frequency_convention: FrequencyConvention,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            cutoff_margin_days: 2,
            frequency_convention: FrequencyConvention::default(),
        }
    }
}

/// Penalty and stopping rules for one model fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub penalizer: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let optimizer = OptimizerOptions::default();
        Self {
            penalizer: 0.02,
            max_iterations: optimizer.max_iterations,
            tolerance: optimizer.tolerance,
        }
    }
}

impl ModelConfig {
    fn optimizer(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !(self.penalizer.is_finite() && self.penalizer >= 0.0) {
            return Err(invalid(
                field,
                format!("penalizer must be non-negative, got {}", self.penalizer),
            ));
        }
        self.optimizer().validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonetaryConfig {
    pub penalizer: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub constrain_q: bool,
}

impl Default for MonetaryConfig {
    fn default() -> Self {
        let shared = ModelConfig::default();
        Self {
            penalizer: shared.penalizer,
            max_iterations: shared.max_iterations,
            tolerance: shared.tolerance,
            // Customers without repeat purchases are valued at the population
            // mean, which only exists for q > 1.
            constrain_q: true,
        }
    }
}

impl MonetaryConfig {
    fn model(&self) -> ModelConfig {
        ModelConfig {
            penalizer: self.penalizer,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }
}

/// Prediction horizons for expected transaction counts, in weeks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonConfig {
    pub short_weeks: f64,
    pub long_weeks: f64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            short_weeks: 12.0,
            long_weeks: 24.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForecastConfig {
    /// Turn a non-converged fit into an error instead of a warning.
    pub require_convergence: bool,
    pub data: DataConfig,
    pub features: FeatureConfig,
    pub timing: ModelConfig,
    pub monetary: MonetaryConfig,
    pub horizons: HorizonConfig,
    pub projection: ProjectionOptions,
    pub segmentation: SegmentationPolicy,
}

impl ForecastConfig {
    /// Loads a configuration from a TOML file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(self.to_toml()?.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data.separator.is_ascii() {
            return Err(invalid("data.separator", "separator must be a single ASCII character"));
        }
        let (lower, upper) = (self.data.lower_quantile, self.data.upper_quantile);
        if !(0.0 <= lower && lower < upper && upper <= 1.0) {
            return Err(invalid(
                "data.lower_quantile",
                format!("quantiles must satisfy 0 <= lower < upper <= 1, got {lower} and {upper}"),
            ));
        }
        if self.features.cutoff_margin_days < 0 {
            return Err(invalid(
                "features.cutoff_margin_days",
                "margin must be non-negative",
            ));
        }
        self.timing.validate("timing")?;
        self.monetary.model().validate("monetary")?;
        for (field, weeks) in [
            ("horizons.short_weeks", self.horizons.short_weeks),
            ("horizons.long_weeks", self.horizons.long_weeks),
        ] {
            if !(weeks.is_finite() && weeks >= 0.0) {
                return Err(invalid(field, format!("horizon must be non-negative, got {weeks}")));
            }
        }
        self.projection.validate()?;
        self.segmentation.validate()?;
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            separator: self.data.separator as u8,
            capping: self.data.cap_outliers.then_some(CappingQuantiles {
                lower: self.data.lower_quantile,
                upper: self.data.upper_quantile,
            }),
        }
    }

    pub fn timing_options(&self) -> TimingFitOptions {
        TimingFitOptions {
            penalizer: self.timing.penalizer,
            optimizer: self.timing.optimizer(),
        }
    }

    pub fn monetary_options(&self) -> MonetaryFitOptions {
        MonetaryFitOptions {
            penalizer: self.monetary.penalizer,
            constrain_q: self.monetary.constrain_q,
            optimizer: self.monetary.model().optimizer(),
        }
    }
}
