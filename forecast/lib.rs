#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod data;
pub mod diagnostics;
pub mod features;
pub mod monetary;
pub mod optimize;
pub mod outliers;
pub mod pipeline;
pub mod projection;
pub mod report;
pub mod segment;
pub mod special;
pub mod timing;

pub use config::ForecastConfig;
pub use features::{CustomerSummary, FrequencyConvention, TransactionSummary};
pub use monetary::{MonetaryFit, MonetaryModelParams, MonetaryObservation};
pub use pipeline::{CustomerProjection, Forecast};
pub use timing::{TimingFit, TimingModelParams, TimingObservation};
