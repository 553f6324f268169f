//! Forward-looking target labels
//!
//! A label for row `i` aggregates the next `window` values of the target
//! field. Rows without that much future data stay unlabeled.

use crate::error::{Result, StocknubError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregation rule of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    MedianGain,
    MaxLoss,
    LinearTrend,
}

impl LabelType {
    pub const ALL: [LabelType; 3] = [
        LabelType::MedianGain,
        LabelType::MaxLoss,
        LabelType::LinearTrend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::MedianGain => "median_gain",
            LabelType::MaxLoss => "max_loss",
            LabelType::LinearTrend => "linear_trend",
        }
    }

    /// Name of the positive (target) class
    pub fn positive_class(&self) -> &'static str {
        match self {
            LabelType::MedianGain => "High Gain",
            LabelType::MaxLoss => "Low Risk",
            LabelType::LinearTrend => "Up Trend",
        }
    }

    /// Name of the negative class
    pub fn negative_class(&self) -> &'static str {
        match self {
            LabelType::MedianGain => "Low Gain",
            LabelType::MaxLoss => "High Risk",
            LabelType::LinearTrend => "Down Trend",
        }
    }

    /// Decision threshold over a set of raw label values.
    /// Values at or above the threshold are the positive class.
    pub fn class_threshold(&self, values: &[f64]) -> Option<f64> {
        let quantile = match self {
            LabelType::MedianGain => 0.8,
            LabelType::MaxLoss => 0.6,
            LabelType::LinearTrend => return Some(0.0),
        };
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        Some(interpolated_quantile(finite, quantile))
    }
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabelType {
    type Err = StocknubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "median_gain" => Ok(LabelType::MedianGain),
            "max_loss" => Ok(LabelType::MaxLoss),
            "linear_trend" => Ok(LabelType::LinearTrend),
            other => Err(StocknubError::UnknownLabelType(other.to_string())),
        }
    }
}

/// One labeled column: rule, forward window and source field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub label_type: LabelType,
    pub window: usize,
    pub target_field: String,
}

impl LabelSpec {
    pub fn new(label_type: LabelType, window: usize, target_field: impl Into<String>) -> Self {
        Self {
            label_type,
            window,
            target_field: target_field.into(),
        }
    }

    /// Column name in the labeled dataset
    pub fn column_name(&self) -> String {
        label_column(self.label_type, self.window)
    }

    /// Label value from the current target value and the following rows.
    /// `None` when fewer than `window` future values exist.
    pub fn compute(&self, current: f64, forward: &[f64]) -> Option<f64> {
        if self.window == 0 || forward.len() < self.window || current == 0.0 {
            return None;
        }
        let forward = &forward[..self.window];
        if !current.is_finite() || forward.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let value = match self.label_type {
            LabelType::MedianGain => {
                let q = interpolated_quantile(forward.to_vec(), 0.4);
                100.0 * (q - current) / current
            }
            LabelType::MaxLoss => {
                let min = forward.iter().fold(f64::MAX, |a, &b| a.min(b));
                100.0 * (min - current) / current
            }
            LabelType::LinearTrend => slope_through_origin(forward),
        };
        Some(value)
    }
}

/// Column name for a label type and window
pub fn label_column(label_type: LabelType, window: usize) -> String {
    format!("{}_{}d", label_type.as_str(), window)
}

/// Least-squares slope of `y - y[0]` against `0..n`, without intercept
fn slope_through_origin(values: &[f64]) -> f64 {
    let base = values[0];
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (x, &y)| {
            let x = x as f64;
            (num + x * (y - base), den + x * x)
        });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Quantile `q` of a non-empty sample, interpolating linearly between the
/// two closest order statistics at position `(n - 1) * q`
fn interpolated_quantile(mut values: Vec<f64>, q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let h = (values.len() - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    values[lo] + (h - lo as f64) * (values[hi] - values[lo])
}

/// Largest window over a set of label specs
pub fn max_window(specs: &[LabelSpec]) -> usize {
    specs.iter().map(|s| s.window).max().unwrap_or(0)
}
