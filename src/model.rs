//! Classifiers and evaluation metrics
//!
//! The registry only depends on the [`Trainer`] trait and the serializable
//! [`FittedModel`]; the logistic regression here is the default backend.

use crate::error::{Result, StocknubError};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Training backend
pub trait Trainer: Send + Sync {
    /// Fit on row-major features and boolean targets (true = positive class)
    fn fit(&self, features: &[Vec<f64>], targets: &[bool]) -> Result<FittedModel>;

    fn name(&self) -> &str;
}

/// Serialized predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedModel {
    Logistic(LogisticModel),
}

impl FittedModel {
    /// Probability of the positive class, in [0, 1]
    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        match self {
            FittedModel::Logistic(model) => model.predict_proba(row),
        }
    }

    /// Number of features the model expects
    pub fn n_features(&self) -> usize {
        match self {
            FittedModel::Logistic(model) => model.weights.len(),
        }
    }
}

/// Standardized logistic regression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let z = self.bias
            + row
                .iter()
                .zip(&self.means)
                .zip(&self.scales)
                .zip(&self.weights)
                .map(|(((x, m), s), w)| w * (x - m) / s)
                .sum::<f64>();
        sigmoid(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// L2-regularized logistic regression fit by full-batch gradient descent.
/// Deterministic: zero initialization, no shuffling.
#[derive(Debug, Clone, Copy)]
pub struct LogisticTrainer {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for LogisticTrainer {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 300,
            l2: 0.01,
        }
    }
}

impl Trainer for LogisticTrainer {
    fn fit(&self, features: &[Vec<f64>], targets: &[bool]) -> Result<FittedModel> {
        let n = features.len();
        if n == 0 || n != targets.len() {
            return Err(StocknubError::DataError(format!(
                "cannot fit on {} rows with {} targets",
                n,
                targets.len()
            )));
        }
        let width = features[0].len();
        if features.iter().any(|row| row.len() != width) {
            return Err(StocknubError::DataError("ragged feature matrix".to_string()));
        }

        let mut means = vec![0.0; width];
        let mut scales = vec![1.0; width];
        for j in 0..width {
            let column: Vec<f64> = features.iter().map(|row| row[j]).collect();
            means[j] = column.iter().mean();
            let sd = column.iter().population_std_dev();
            if sd.is_finite() && sd > 1e-12 {
                scales[j] = sd;
            }
        }
        let x: Vec<Vec<f64>> = features
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| (v - means[j]) / scales[j])
                    .collect()
            })
            .collect();
        let y: Vec<f64> = targets.iter().map(|&t| if t { 1.0 } else { 0.0 }).collect();

        let mut weights = vec![0.0; width];
        let mut bias = 0.0;
        let inv_n = 1.0 / n as f64;
        for _ in 0..self.epochs {
            let mut grad_w = vec![0.0; width];
            let mut grad_b = 0.0;
            for (row, &target) in x.iter().zip(&y) {
                let z = bias + row.iter().zip(&weights).map(|(a, w)| a * w).sum::<f64>();
                let err = sigmoid(z) - target;
                for (g, a) in grad_w.iter_mut().zip(row) {
                    *g += err * a;
                }
                grad_b += err;
            }
            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * (g * inv_n + self.l2 * *w);
            }
            bias -= self.learning_rate * grad_b * inv_n;
        }

        Ok(FittedModel::Logistic(LogisticModel {
            means,
            scales,
            weights,
            bias,
        }))
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

// ========== Metrics ==========

/// Quality of a model on one split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    pub rows: usize,
    pub positives: usize,
    /// `None` when the split holds a single class
    pub auc: Option<f64>,
    /// 2 * AUC - 1
    pub gini: Option<f64>,
    /// Share of rows classified correctly at p = 0.5
    pub accuracy: f64,
    /// Rank correlation between probability and the raw label value
    pub spearman: Option<f64>,
}

impl SplitMetrics {
    pub fn evaluate(probabilities: &[f64], targets: &[bool], raw_labels: &[f64]) -> Self {
        let auc = auc(probabilities, targets);
        Self {
            rows: targets.len(),
            positives: targets.iter().filter(|&&t| t).count(),
            auc,
            gini: auc.map(gini),
            accuracy: accuracy(probabilities, targets),
            spearman: spearman(probabilities, raw_labels),
        }
    }
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged
pub fn auc(scores: &[f64], targets: &[bool]) -> Option<f64> {
    let positives = targets.iter().filter(|&&t| t).count();
    let negatives = targets.len() - positives;
    if positives == 0 || negatives == 0 || scores.len() != targets.len() {
        return None;
    }
    let ranks = average_ranks(scores);
    let rank_sum: f64 = ranks
        .iter()
        .zip(targets)
        .filter(|(_, &t)| t)
        .map(|(r, _)| r)
        .sum();
    let p = positives as f64;
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

pub fn gini(auc: f64) -> f64 {
    2.0 * auc - 1.0
}

pub fn accuracy(probabilities: &[f64], targets: &[bool]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = probabilities
        .iter()
        .zip(targets)
        .filter(|(&p, &t)| (p >= 0.5) == t)
        .count();
    correct as f64 / targets.len() as f64
}

/// Spearman rank correlation; `None` when either side is constant
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ra = average_ranks(a);
    let rb = average_ranks(b);
    let sd_a = ra.iter().population_std_dev();
    let sd_b = rb.iter().population_std_dev();
    if !(sd_a > 0.0 && sd_b > 0.0) {
        return None;
    }
    let cov = ra.iter().population_covariance(rb.iter());
    Some(cov / (sd_a * sd_b))
}

/// 1-based ranks with ties sharing their average rank
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}
