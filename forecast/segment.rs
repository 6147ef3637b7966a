// forecast/segment.rs

//! Assigns customers to ordered value tiers, either by equal-count quantile
//! buckets or by fixed breakpoints. Tier 0 is always the lowest tier, and
//! labels are listed from the lowest tier to the highest.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Letters used for default labels; the highest tier gets `A`.
const DEFAULT_LABEL_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Bucket count when a quantile policy does not name one.
const DEFAULT_BUCKETS: usize = 4;

fn default_buckets() -> usize {
    DEFAULT_BUCKETS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SegmentationPolicy {
    /// `buckets` groups of (nearly) equal size by rank.
    Quantile {
        #[serde(default = "default_buckets")]
        buckets: usize,
        #[serde(default)]
        labels: Vec<String>,
    },
    /// Right-closed bins between strictly increasing breakpoints.
    Thresholds {
        breakpoints: Vec<f64>,
        #[serde(default)]
        labels: Vec<String>,
    },
}

impl Default for SegmentationPolicy {
    fn default() -> Self {
        SegmentationPolicy::Quantile {
            buckets: DEFAULT_BUCKETS,
            labels: Vec::new(),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SegmentError {
    #[error(
        "Cannot form {buckets} quantile buckets from {distinct} distinct values. Use fewer buckets."
    )]
    DegenerateBuckets { buckets: usize, distinct: usize },

    #[error("Breakpoints must be finite and strictly increasing, got {0:?}.")]
    DegenerateBreakpoints(Vec<f64>),

    #[error("Value at position {index} is not finite ({value}).")]
    NonFiniteValue { index: usize, value: f64 },

    #[error("Expected {expected} labels (one per tier), but {found} were given.")]
    LabelCountMismatch { expected: usize, found: usize },

    #[error("Default labels cover at most {max} tiers, but {requested} were requested.")]
    TooManyTiers { requested: usize, max: usize },
}

impl SegmentationPolicy {
    /// Number of tiers the policy produces.
    pub fn tier_count(&self) -> usize {
        match self {
            SegmentationPolicy::Quantile { buckets, .. } => *buckets,
            SegmentationPolicy::Thresholds { breakpoints, .. } => breakpoints.len() + 1,
        }
    }

    fn labels(&self) -> &[String] {
        match self {
            SegmentationPolicy::Quantile { labels, .. }
            | SegmentationPolicy::Thresholds { labels, .. } => labels,
        }
    }

    /// Checks everything that does not depend on the data.
    pub fn validate(&self) -> Result<(), SegmentError> {
        if let SegmentationPolicy::Thresholds { breakpoints, .. } = self {
            let increasing = breakpoints.windows(2).all(|pair| pair[0] < pair[1]);
            if !increasing || breakpoints.iter().any(|b| !b.is_finite()) {
                return Err(SegmentError::DegenerateBreakpoints(breakpoints.clone()));
            }
        }
        self.resolved_labels().map(|_| ())
    }

    fn resolved_labels(&self) -> Result<Vec<String>, SegmentError> {
        let tiers = self.tier_count();
        let labels = self.labels();
        if labels.is_empty() {
            return default_labels(tiers);
        }
        if labels.len() != tiers {
            return Err(SegmentError::LabelCountMismatch {
                expected: tiers,
                found: labels.len(),
            });
        }
        Ok(labels.to_vec())
    }
}

/// Letter labels ordered lowest tier first, so four tiers give `D, C, B, A`.
pub fn default_labels(tiers: usize) -> Result<Vec<String>, SegmentError> {
    let max = DEFAULT_LABEL_ALPHABET.len();
    if tiers > max {
        return Err(SegmentError::TooManyTiers {
            requested: tiers,
            max,
        });
    }
    Ok(DEFAULT_LABEL_ALPHABET.as_bytes()[..tiers]
        .iter()
        .rev()
        .map(|&letter| char::from(letter).to_string())
        .collect())
}

/// A tier index per record plus the labels those indices refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub labels: Vec<String>,
    pub tiers: Vec<usize>,
}

impl Segmentation {
    /// Label of the record at `index`.
    pub fn label(&self, index: usize) -> &str {
        &self.labels[self.tiers[index]]
    }
}

/// Index of the right-closed bin `value` falls into.
pub fn threshold_tier(value: f64, breakpoints: &[f64]) -> usize {
    breakpoints.partition_point(|&b| b < value)
}

fn quantile_tiers(values: &[f64], buckets: usize) -> Result<Vec<usize>, SegmentError> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));

    let distinct = 1 + order
        .windows(2)
        .filter(|pair| values[pair[0]] != values[pair[1]])
        .count();
    let distinct = if values.is_empty() { 0 } else { distinct };
    if buckets == 0 || buckets > distinct {
        return Err(SegmentError::DegenerateBuckets { buckets, distinct });
    }

    let n = values.len();
    let mut tiers = vec![0; n];
    for (position, &index) in order.iter().enumerate() {
        tiers[index] = position * buckets / n;
    }
    Ok(tiers)
}

/// Segments `values` according to `policy`.
pub fn segment(values: &[f64], policy: &SegmentationPolicy) -> Result<Segmentation, SegmentError> {
    policy.validate()?;
    if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(SegmentError::NonFiniteValue { index, value });
    }

    let tiers = match policy {
        SegmentationPolicy::Quantile { buckets, .. } => quantile_tiers(values, *buckets)?,
        SegmentationPolicy::Thresholds { breakpoints, .. } => values
            .iter()
            .map(|&v| threshold_tier(v, breakpoints))
            .collect(),
    };

    Ok(Segmentation {
        labels: policy.resolved_labels()?,
        tiers,
    })
}

/// Count, mean and total of the segmented values in one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSummary {
    pub label: String,
    pub count: usize,
    /// `None` for an empty tier.
    pub mean: Option<f64>,
    pub sum: f64,
}

/// Per-tier aggregates, lowest tier first.
pub fn summarize(values: &[f64], segmentation: &Segmentation) -> Vec<TierSummary> {
    let mut counts = vec![0_usize; segmentation.labels.len()];
    let mut sums = vec![0.0_f64; segmentation.labels.len()];
    for (&value, &tier) in values.iter().zip(&segmentation.tiers) {
        counts[tier] += 1;
        sums[tier] += value;
    }

    segmentation
        .labels
        .iter()
        .zip(counts.into_iter().zip(sums))
        .map(|(label, (count, sum))| TierSummary {
            label: label.clone(),
            count,
            mean: (count > 0).then(|| sum / count as f64),
            sum,
        })
        .collect()
}
